use std::fmt;
use std::str::FromStr;

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Maximum length, in characters, of an error message persisted in a job
/// state record. Longer messages are truncated before the write.
pub const MAX_ERROR_LEN: usize = 500;

/// Lifecycle state of one pipeline step, persisted under the build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Started,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// A status is terminal once no further transition can happen to it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InProgress => write!(f, "inProgress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        if status.eq_ignore_ascii_case("started") {
            Ok(Self::Started)
        } else if status.eq_ignore_ascii_case("inProgress") {
            Ok(Self::InProgress)
        } else if status.eq_ignore_ascii_case("succeeded") {
            Ok(Self::Succeeded)
        } else if status.eq_ignore_ascii_case("failed") {
            Ok(Self::Failed)
        } else if status.eq_ignore_ascii_case("canceled") {
            Ok(Self::Canceled)
        } else {
            Err(ParseJobStatusError(status.to_owned()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(
    "`{0}` is not a valid job status. Available statuses are {available}.",
    available = enum_iterator::all::<JobStatus>()
        .map(|s| format!("`{s}`"))
        .collect::<Vec<String>>()
        .join(", ")
)]
pub struct ParseJobStatusError(pub String);

/// One phase of an index pipeline run. Phases always execute in `pre`,
/// `index`, `post` order; a caller may request any non-empty subsequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Pre,
    Index,
    Post,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Pre => "pre",
            Step::Index => "index",
            Step::Post => "post",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = ParseStepError;

    fn from_str(step: &str) -> Result<Self, Self::Err> {
        if step.eq_ignore_ascii_case("pre") {
            Ok(Self::Pre)
        } else if step.eq_ignore_ascii_case("index") {
            Ok(Self::Index)
        } else if step.eq_ignore_ascii_case("post") {
            Ok(Self::Post)
        } else {
            Err(ParseStepError(step.to_owned()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(
    "`{0}` is not a valid index step. Available steps are {available}.",
    available = enum_iterator::all::<Step>()
        .map(|s| format!("`{s}`"))
        .collect::<Vec<String>>()
        .join(", ")
)]
pub struct ParseStepError(pub String);

/// One phase of a snapshot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotStep {
    Pre,
    Snapshot,
    Post,
}

impl SnapshotStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStep::Pre => "pre",
            SnapshotStep::Snapshot => "snapshot",
            SnapshotStep::Post => "post",
        }
    }
}

impl fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStep {
    type Err = ParseStepError;

    fn from_str(step: &str) -> Result<Self, Self::Err> {
        if step.eq_ignore_ascii_case("pre") {
            Ok(Self::Pre)
        } else if step.eq_ignore_ascii_case("snapshot") {
            Ok(Self::Snapshot)
        } else if step.eq_ignore_ascii_case("post") {
            Ok(Self::Post)
        } else {
            Err(ParseStepError(step.to_owned()))
        }
    }
}

/// Controls the pre-existence policy of the destination index and the
/// per-document write behavior of the workers.
///
/// - `index` (default): the destination must not exist; create it.
/// - `resume`: the destination must exist; add missing documents.
/// - `merge`: the destination must exist; deep-merge incoming documents
///   over the currently indexed ones.
/// - `purge`: delete the destination if it exists, then create it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum IndexMode {
    #[default]
    Index,
    Resume,
    Merge,
    Purge,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Resume => write!(f, "resume"),
            Self::Merge => write!(f, "merge"),
            Self::Purge => write!(f, "purge"),
        }
    }
}

impl FromStr for IndexMode {
    type Err = ParseIndexModeError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        if mode.eq_ignore_ascii_case("index") {
            Ok(Self::Index)
        } else if mode.eq_ignore_ascii_case("resume") {
            Ok(Self::Resume)
        } else if mode.eq_ignore_ascii_case("merge") {
            Ok(Self::Merge)
        } else if mode.eq_ignore_ascii_case("purge") {
            Ok(Self::Purge)
        } else {
            Err(ParseIndexModeError(mode.to_owned()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(
    "`{0}` is not a valid index mode. Available modes are {available}.",
    available = enum_iterator::all::<IndexMode>()
        .map(|m| format!("`{m}`"))
        .collect::<Vec<String>>()
        .join(", ")
)]
pub struct ParseIndexModeError(pub String);

/// Per-step lifecycle record persisted under
/// `index.<index_name>.<step>` or `snapshot.<snapshot_name>.<step>`
/// of the owning build record.
///
/// `transient` marks a state that a crashed process may have left behind;
/// the managers promote every transient record to `canceled` at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub status: JobStatus,
    pub transient: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobState {
    pub fn started() -> Self {
        JobState {
            status: JobStatus::Started,
            transient: true,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            err: None,
            result: None,
        }
    }

    /// Final-state writes flip `transient` off in the same record so a crash
    /// cannot leave a finished step looking stuck at `started`.
    pub fn succeed(mut self, result: serde_json::Value) -> Self {
        self.status = JobStatus::Succeeded;
        self.transient = false;
        self.ended_at = Some(OffsetDateTime::now_utc());
        self.err = None;
        self.result = Some(result);
        self
    }

    pub fn fail(mut self, err: &str) -> Self {
        self.status = JobStatus::Failed;
        self.transient = false;
        if self.ended_at.is_none() {
            self.ended_at = Some(OffsetDateTime::now_utc());
        }
        self.err = Some(truncate_error(err));
        self.result = None;
        self
    }

    pub fn cancel(mut self) -> Self {
        self.status = JobStatus::Canceled;
        self.transient = false;
        if self.ended_at.is_none() {
            self.ended_at = Some(OffsetDateTime::now_utc());
        }
        self
    }
}

/// Clamps an error message to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(err: &str) -> String {
    err.chars().take(MAX_ERROR_LEN).collect()
}
