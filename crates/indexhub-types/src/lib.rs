//! Shared vocabulary of the hub: build records, job lifecycle states, index
//! settings and mappings, and the configuration surface. Everything here is
//! plain data; the moving parts live in the `index-pipeline` crate.

pub mod build;
pub mod config;
pub mod merge;
pub mod settings;
pub mod tasks;

pub use build::{BuildDoc, BuildError, SourceBackend};
pub use config::{
    BulkArgs, CloudConfig, EngineArgs, EngineRef, EnvConfig, HubConfig, IndexInfo, IndexerEnv,
    IndexerSelect, RepositoryConfig, RepositoryType, SnapshotConfig, SnapshotEnv,
    SourceStoreConfig, StoreConnArgs,
};
pub use merge::deep_merge;
pub use settings::{EngineVersion, IndexMappings, IndexSettings, HUB_DOC_TYPE_KEY};
pub use tasks::{IndexMode, JobState, JobStatus, SnapshotStep, Step, MAX_ERROR_LEN};
