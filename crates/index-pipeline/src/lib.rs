/*!
This crate drives the materialization of finished builds into search-engine
indices, and the snapshotting of those indices into repositories.

The control plane is a cooperative tokio task: one [`indexer::Indexer`] owns
one `(source collection, destination index)` pair for the duration of one
`index` call and drives its three steps (`pre`, `index`, `post`) in order,
recording per-step lifecycle state in the owning build record through the
[`registrar::JobStateRegistrar`]. The data plane is multi-process: each batch
of document ids is serialized into a [`dispatch::BatchDescriptor`] and handed
to a worker process which reopens its own clients, streams the documents and
pushes them with bulk writes ([`task::IndexingTask`]).

Snapshots follow the same step shape (`pre`, `snapshot`, `post`) under the
[`snapshot::Snapshooter`], which reconciles the target repository first and
then polls the engine until the snapshot reaches a terminal state.

The document store, the search engine, and the build-record store are
collaborators reached through the traits in [`clients`]; the managers in
[`manager`] and [`snapshot`] wire configured environments to concrete
clients and guard management operations behind a single-flight admission
check in [`pool`].
*/

pub mod clients;
pub mod dispatch;
pub mod error;
pub mod indexer;
pub mod manager;
pub mod pool;
pub mod registrar;
pub mod schedule;
pub mod snapshot;
pub mod task;
#[cfg(test)]
mod test_utils;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use error::Error;
pub use indexer::{ColdHotIndexer, IndexParams, Indexer, PipelineContext};
pub use manager::{IndexManager, IndexRequest};
pub use schedule::Schedule;
pub use snapshot::{SnapshotManager, Snapshooter};
