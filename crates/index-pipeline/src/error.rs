use indexhub_types::build::BuildError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("`batch_size` out of range: {0}. It should be a value between 50 and 10000.")]
    BatchSizeOutOfRange(usize),
    #[error("at least one step must be requested")]
    EmptySteps,
    #[error("steps must be an ordered subsequence of `pre`, `index`, `post`")]
    InvalidSteps,
    #[error(
        "Index `{0}` already exists. Use mode `purge` to auto-delete it \
         or mode `resume` to add more documents."
    )]
    IndexAlreadyExists(String),
    #[error("Index `{0}` does not exist.")]
    IndexMissing(String),
    #[error("Cannot find build `{0}`.")]
    BuildNotFound(String),
    #[error("Cannot find a build config for `{0}`.")]
    BuildConfigMissing(String),
    #[error("Collection `{collection}` does not exist in database `{db}`.")]
    SourceCollectionMissing { db: String, collection: String },
    #[error("Batch {batch} failed: {message}")]
    BatchFailed { batch: u64, message: String },
    #[error(
        "Snapshot `{snapshot}` partially failed: state is {state} but {failed_shards} shards failed."
    )]
    SnapshotPartial { snapshot: String, state: String, failed_shards: u64 },
    #[error("Snapshot `{snapshot}` failed: state is {state}.")]
    SnapshotFailed { snapshot: String, state: String },
    #[error(
        "Multiple indexer rules matched build `{build}`: {}.",
        .paths.iter().map(|p| format!("`{p}`")).collect::<Vec<_>>().join(", ")
    )]
    AmbiguousIndexerSelection { build: String, paths: Vec<String> },
    #[error("Unknown environment `{0}`.")]
    UnknownEnvironment(String),
    #[error("{0}")]
    Config(String),
    #[error("The search engine answered {status}: {message}")]
    Engine { status: u16, message: String },

    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// `true` for the input-validation errors that are raised before any
    /// state is written.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            Error::BatchSizeOutOfRange(_) | Error::EmptySteps | Error::InvalidSteps
        )
    }
}
