//! Collaborator seams: the search engine, the document store holding source
//! collections, and the build-record store. The pipeline only ever talks to
//! these traits; deployments plug their own clients, and the bundled
//! implementations cover the common case (HTTP engine, JSONL store,
//! one-file-per-build record store).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexhub_types::build::BuildDoc;
use indexhub_types::config::{EngineArgs, StoreConnArgs};
use indexhub_types::settings::EngineVersion;
use indexhub_types::tasks::JobState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub(crate) mod build_store;
mod search;
mod store;

pub use build_store::FsBuildStore;
pub use search::HttpSearchEngine;
pub use store::{connect_store, JsonlStore};

/// One create-or-overwrite bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAction {
    pub id: String,
    pub doc: Value,
}

/// Outcome of a bulk call: how many actions landed, and the per-document
/// rejections that did not.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BulkReport {
    pub indexed: u64,
    /// `(document id, engine error)` pairs for rejected actions.
    pub errors: Vec<(String, String)>,
}

/// State reported by the engine for an in-flight or finished snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Init,
    InProgress,
    Started,
    Success,
    Failed,
    Partial,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Init => "INIT",
            SnapshotState::InProgress => "IN_PROGRESS",
            SnapshotState::Started => "STARTED",
            SnapshotState::Success => "SUCCESS",
            SnapshotState::Failed => "FAILED",
            SnapshotState::Partial => "PARTIAL",
        }
    }

    /// `true` while the engine is still working on the snapshot.
    pub fn is_running(&self) -> bool {
        matches!(self, SnapshotState::Init | SnapshotState::InProgress | SnapshotState::Started)
    }
}

impl FromStr for SnapshotState {
    type Err = ();

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "INIT" => Ok(SnapshotState::Init),
            "IN_PROGRESS" => Ok(SnapshotState::InProgress),
            "STARTED" => Ok(SnapshotState::Started),
            "SUCCESS" => Ok(SnapshotState::Success),
            "FAILED" => Ok(SnapshotState::Failed),
            "PARTIAL" => Ok(SnapshotState::Partial),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStatus {
    pub state: SnapshotState,
    pub failed_shards: u64,
}

/// The destination search engine. Control-plane calls are awaited on the
/// cooperative loop; `bulk` is also used from worker processes.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn version(&self) -> Result<EngineVersion>;
    async fn index_exists(&self, index: &str) -> Result<bool>;
    async fn create_index(&self, index: &str, body: &Value) -> Result<Value>;
    /// Deletes an index, succeeding even when it does not exist.
    async fn delete_index(&self, index: &str) -> Result<Value>;
    /// Index names matching `pattern`, each with its alias list.
    async fn list_indices(&self, pattern: &str) -> Result<BTreeMap<String, Vec<String>>>;
    async fn get_mapping(&self, index: &str) -> Result<Value>;
    async fn put_mapping_meta(&self, index: &str, meta: &Value) -> Result<Value>;
    /// Currently-indexed documents for `ids`, in order, `None` when absent.
    async fn get_documents(&self, index: &str, ids: &[String]) -> Result<Vec<Option<Value>>>;
    async fn bulk(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport>;

    async fn get_repository(&self, repository: &str) -> Result<Option<Value>>;
    async fn create_repository(&self, repository: &str, body: &Value) -> Result<Value>;
    async fn create_snapshot(&self, repository: &str, snapshot: &str) -> Result<Value>;
    async fn snapshot_status(&self, repository: &str, snapshot: &str) -> Result<SnapshotStatus>;
}

/// The document store holding source collections.
#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    async fn list_collections(&self, db: &str) -> Result<Vec<String>>;
    async fn count(&self, db: &str, collection: &str) -> Result<u64>;
    /// Streams the collection's `_id`s in chunks of `batch_size`.
    fn id_batches(
        &self,
        db: &str,
        collection: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<String>>>;
    /// Fetches the documents whose `_id` is in `ids`, in no particular order.
    async fn fetch(&self, db: &str, collection: &str, ids: &[String]) -> Result<Vec<Value>>;
}

/// Which section of a build record a lifecycle write lands under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSection {
    Index,
    Snapshot,
}

impl StateSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateSection::Index => "index",
            StateSection::Snapshot => "snapshot",
        }
    }
}

/// The durable store of build records and their lifecycle sub-records.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get_build(&self, build_id: &str) -> Result<Option<BuildDoc>>;
    /// The build whose `_id` is `index`, or failing that the first build
    /// carrying an `index.<index>` lifecycle record.
    async fn find_build_for_index(&self, index: &str) -> Result<Option<BuildDoc>>;
    async fn read_state(
        &self,
        build_id: &str,
        section: StateSection,
        key: &str,
        step: &str,
    ) -> Result<Option<JobState>>;
    /// Writes one lifecycle record under
    /// `<section>.<key>.<step>`, creating intermediate objects as needed.
    /// The whole record lands in one write so `transient` can never be
    /// observed apart from its status.
    async fn write_state(
        &self,
        build_id: &str,
        section: StateSection,
        key: &str,
        step: &str,
        state: &JobState,
    ) -> Result<()>;
    /// Stamps the environment name on a snapshot record.
    async fn write_snapshot_env(&self, build_id: &str, snapshot: &str, env: &str) -> Result<()>;
    /// Promotes every `transient: true` record of every build to
    /// `canceled`, returning how many records were rewritten.
    async fn prune_transient(&self) -> Result<u64>;
}

/// Opens a [`DocumentStore`] from serialized connection arguments. Injected
/// so tests run against in-memory stores while production resolves the URI
/// scheme.
pub trait StoreProvider: Send + Sync {
    fn open(&self, args: &StoreConnArgs) -> Result<Arc<dyn DocumentStore>>;
}

/// Opens a [`SearchEngine`] from per-environment client arguments.
pub trait EngineProvider: Send + Sync {
    fn open(&self, args: &EngineArgs) -> Result<Arc<dyn SearchEngine>>;
}

/// Resolves the URI scheme of the connection arguments.
#[derive(Debug, Default)]
pub struct DefaultStoreProvider;

impl StoreProvider for DefaultStoreProvider {
    fn open(&self, args: &StoreConnArgs) -> Result<Arc<dyn DocumentStore>> {
        connect_store(args)
    }
}

/// Builds [`HttpSearchEngine`] clients.
#[derive(Debug, Default)]
pub struct HttpEngineProvider;

impl EngineProvider for HttpEngineProvider {
    fn open(&self, args: &EngineArgs) -> Result<Arc<dyn SearchEngine>> {
        Ok(Arc::new(HttpSearchEngine::new(args)?))
    }
}
