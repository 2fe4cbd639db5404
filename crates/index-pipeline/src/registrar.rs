use std::sync::Arc;

use indexhub_types::tasks::{truncate_error, JobState, JobStatus};
use serde_json::Value;

use crate::clients::{BuildStore, StateSection};
use crate::Result;

/// Persists per-step lifecycle records under one build record, keyed by
/// `(build id, section, index or snapshot name)`.
///
/// `started` marks a step transient; `succeeded` and `failed` write the
/// terminal state and the `transient: false` flag in a single record, so a
/// crash between the two can never leave a finished step looking stuck.
pub struct JobStateRegistrar {
    store: Arc<dyn BuildStore>,
    build_id: String,
    section: StateSection,
    key: String,
}

impl JobStateRegistrar {
    /// Registrar for `index.<index_name>.*` records.
    pub fn index(store: Arc<dyn BuildStore>, build_id: &str, index_name: &str) -> Self {
        JobStateRegistrar {
            store,
            build_id: build_id.to_owned(),
            section: StateSection::Index,
            key: index_name.to_owned(),
        }
    }

    /// Registrar for `snapshot.<snapshot_name>.*` records.
    pub fn snapshot(store: Arc<dyn BuildStore>, build_id: &str, snapshot_name: &str) -> Self {
        JobStateRegistrar {
            store,
            build_id: build_id.to_owned(),
            section: StateSection::Snapshot,
            key: snapshot_name.to_owned(),
        }
    }

    pub async fn started(&self, step: &str) -> Result<()> {
        self.write(step, JobState::started()).await
    }

    pub async fn succeeded(&self, step: &str, result: Value) -> Result<()> {
        let state = match self.read(step).await? {
            Some(existing) => existing.succeed(result),
            None => JobState::started().succeed(result),
        };
        self.write(step, state).await
    }

    /// Records a failure. A step that already failed keeps its original
    /// `ended_at`; only the message is replaced.
    pub async fn failed(&self, step: &str, err: &str) -> Result<()> {
        let state = match self.read(step).await? {
            Some(existing) if existing.status == JobStatus::Failed => JobState {
                err: Some(truncate_error(err)),
                ..existing
            },
            Some(existing) => existing.fail(err),
            None => JobState::started().fail(err),
        };
        self.write(step, state).await
    }

    pub async fn read(&self, step: &str) -> Result<Option<JobState>> {
        self.store.read_state(&self.build_id, self.section, &self.key, step).await
    }

    async fn write(&self, step: &str, state: JobState) -> Result<()> {
        self.store.write_state(&self.build_id, self.section, &self.key, step, &state).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
