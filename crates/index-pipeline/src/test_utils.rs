//! In-memory collaborators for the pipeline tests: a fake engine, a fake
//! document store, a fake build store, and a dispatcher running batches
//! in-process instead of in child processes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use indexhub_types::build::BuildDoc;
use indexhub_types::config::{EngineArgs, IndexerEnv, SourceStoreConfig, StoreConnArgs};
use indexhub_types::settings::EngineVersion;
use indexhub_types::tasks::JobState;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::clients::build_store::{slot, slot_mut};
use crate::clients::{
    BuildStore, BulkAction, BulkReport, DocumentStore, EngineProvider, SearchEngine,
    SnapshotState, SnapshotStatus, StateSection, StoreProvider,
};
use crate::dispatch::{BatchDescriptor, Dispatch};
use crate::indexer::PipelineContext;
use crate::pool::JobPool;
use crate::task::IndexingTask;
use crate::{Error, Result};

#[derive(Default)]
struct MemIndex {
    docs: BTreeMap<String, Value>,
    body: Value,
    aliases: Vec<String>,
}

#[derive(Default)]
struct EngineState {
    version: Option<EngineVersion>,
    indices: BTreeMap<String, MemIndex>,
    repositories: BTreeMap<String, Value>,
    created_snapshots: Vec<(String, String)>,
    snapshot_script: VecDeque<SnapshotStatus>,
    fail_next_bulk: Option<String>,
    fail_next_create: Option<String>,
    reject_ids: Vec<String>,
}

/// In-memory search engine with scripted failure hooks.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn set_version(&self, major: u64, minor: u64) {
        self.state.lock().unwrap().version = Some(EngineVersion { major, minor });
    }

    pub fn create_bare_index(&self, name: &str) {
        self.state.lock().unwrap().indices.insert(name.to_owned(), MemIndex::default());
    }

    pub fn put_doc(&self, index: &str, id: &str, doc: Value) {
        let mut state = self.state.lock().unwrap();
        state
            .indices
            .get_mut(index)
            .expect("index exists")
            .docs
            .insert(id.to_owned(), doc);
    }

    pub fn doc(&self, index: &str, id: &str) -> Option<Value> {
        self.state.lock().unwrap().indices.get(index)?.docs.get(id).cloned()
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.state.lock().unwrap().indices.get(index).map(|i| i.docs.len()).unwrap_or(0)
    }

    pub fn exists(&self, index: &str) -> bool {
        self.state.lock().unwrap().indices.contains_key(index)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().unwrap().indices.keys().cloned().collect()
    }

    pub fn creation_body(&self, index: &str) -> Option<Value> {
        self.state.lock().unwrap().indices.get(index).map(|i| i.body.clone())
    }

    pub fn set_mapping(&self, index: &str, mappings: Value) {
        let mut state = self.state.lock().unwrap();
        let entry = state.indices.entry(index.to_owned()).or_default();
        entry.body = json!({ "mappings": mappings });
    }

    /// The next bulk call fails whole with this message.
    pub fn fail_next_bulk(&self, message: &str) {
        self.state.lock().unwrap().fail_next_bulk = Some(message.to_owned());
    }

    /// The next index creation is refused with this message.
    pub fn fail_next_create(&self, message: &str) {
        self.state.lock().unwrap().fail_next_create = Some(message.to_owned());
    }

    /// Bulk actions for these ids are rejected per-document.
    pub fn reject_ids(&self, ids: &[&str]) {
        self.state.lock().unwrap().reject_ids = ids.iter().map(|id| id.to_string()).collect();
    }

    /// Statuses the poll loop will observe, in order; the last one repeats.
    pub fn script_snapshot_statuses(&self, statuses: &[SnapshotStatus]) {
        self.state.lock().unwrap().snapshot_script = statuses.iter().copied().collect();
    }

    pub fn created_snapshots(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created_snapshots.clone()
    }

    pub fn repository(&self, name: &str) -> Option<Value> {
        self.state.lock().unwrap().repositories.get(name).cloned()
    }

    pub fn put_repository(&self, name: &str, body: Value) {
        self.state.lock().unwrap().repositories.insert(name.to_owned(), body);
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn version(&self) -> Result<EngineVersion> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .version
            .unwrap_or(EngineVersion { major: 7, minor: 10 }))
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.exists(index))
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_create.take() {
            return Err(Error::Engine { status: 400, message });
        }
        if state.indices.contains_key(index) {
            return Err(Error::Engine {
                status: 400,
                message: format!("resource_already_exists_exception: index [{index}]"),
            });
        }
        state
            .indices
            .insert(index.to_owned(), MemIndex { body: body.clone(), ..MemIndex::default() });
        Ok(json!({ "acknowledged": true, "index": index }))
    }

    async fn delete_index(&self, index: &str) -> Result<Value> {
        self.state.lock().unwrap().indices.remove(index);
        Ok(json!({ "acknowledged": true }))
    }

    async fn list_indices(&self, _pattern: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .indices
            .iter()
            .map(|(name, index)| (name.clone(), index.aliases.clone()))
            .collect())
    }

    async fn get_mapping(&self, index: &str) -> Result<Value> {
        let state = self.state.lock().unwrap();
        let mem = state.indices.get(index).ok_or_else(|| Error::Engine {
            status: 404,
            message: format!("no such index [{index}]"),
        })?;
        let mappings = mem.body.get("mappings").cloned().unwrap_or_else(|| json!({}));
        let mut answer = serde_json::Map::new();
        answer.insert(index.to_owned(), json!({ "mappings": mappings }));
        Ok(Value::Object(answer))
    }

    async fn put_mapping_meta(&self, index: &str, meta: &Value) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        let mem = state.indices.get_mut(index).ok_or_else(|| Error::Engine {
            status: 404,
            message: format!("no such index [{index}]"),
        })?;
        *slot_mut(&mut mem.body, &["mappings", "_meta"]) = meta.clone();
        Ok(json!({ "acknowledged": true }))
    }

    async fn get_documents(&self, index: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let state = self.state.lock().unwrap();
        let mem = state.indices.get(index).ok_or_else(|| Error::Engine {
            status: 404,
            message: format!("no such index [{index}]"),
        })?;
        Ok(ids.iter().map(|id| mem.docs.get(id).cloned()).collect())
    }

    async fn bulk(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_bulk.take() {
            return Err(Error::Engine { status: 502, message });
        }
        let reject_ids = state.reject_ids.clone();
        let mem = state.indices.get_mut(index).ok_or_else(|| Error::Engine {
            status: 404,
            message: format!("no such index [{index}]"),
        })?;
        let mut report = BulkReport::default();
        for action in actions {
            if reject_ids.contains(&action.id) {
                report
                    .errors
                    .push((action.id.clone(), "mapper_parsing_exception".to_owned()));
                continue;
            }
            mem.docs.insert(action.id.clone(), action.doc.clone());
            report.indexed += 1;
        }
        Ok(report)
    }

    async fn get_repository(&self, repository: &str) -> Result<Option<Value>> {
        Ok(self.repository(repository))
    }

    async fn create_repository(&self, repository: &str, body: &Value) -> Result<Value> {
        self.put_repository(repository, body.clone());
        Ok(json!({ "acknowledged": true }))
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state.created_snapshots.push((repository.to_owned(), snapshot.to_owned()));
        Ok(json!({ "accepted": true }))
    }

    async fn snapshot_status(&self, _repository: &str, _snapshot: &str) -> Result<SnapshotStatus> {
        let mut state = self.state.lock().unwrap();
        match state.snapshot_script.len() {
            0 => Ok(SnapshotStatus { state: SnapshotState::Success, failed_shards: 0 }),
            1 => Ok(state.snapshot_script[0]),
            _ => Ok(state.snapshot_script.pop_front().unwrap()),
        }
    }
}

/// In-memory document store: `db -> collection -> docs`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    dbs: Mutex<BTreeMap<String, BTreeMap<String, Vec<Value>>>>,
}

impl MemoryStore {
    pub fn insert(&self, db: &str, collection: &str, docs: Vec<Value>) {
        let mut dbs = self.dbs.lock().unwrap();
        dbs.entry(db.to_owned()).or_default().insert(collection.to_owned(), docs);
    }

    fn docs(&self, db: &str, collection: &str) -> Result<Vec<Value>> {
        let dbs = self.dbs.lock().unwrap();
        dbs.get(db)
            .and_then(|db| db.get(collection))
            .cloned()
            .ok_or_else(|| Error::SourceCollectionMissing {
                db: db.to_owned(),
                collection: collection.to_owned(),
            })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs.get(db).map(|db| db.keys().cloned().collect()).unwrap_or_default())
    }

    async fn count(&self, db: &str, collection: &str) -> Result<u64> {
        Ok(self.docs(db, collection)?.len() as u64)
    }

    fn id_batches(
        &self,
        db: &str,
        collection: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<String>>> {
        let batches = match self.docs(db, collection) {
            Ok(docs) => {
                let ids: Vec<String> = docs
                    .iter()
                    .filter_map(|doc| doc.get("_id").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect();
                ids.chunks(batch_size).map(|chunk| Ok(chunk.to_vec())).collect()
            }
            Err(err) => vec![Err(err)],
        };
        futures::stream::iter(batches).boxed()
    }

    async fn fetch(&self, db: &str, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        let wanted: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        let docs = self.docs(db, collection)?;
        Ok(docs
            .into_iter()
            .filter(|doc| {
                doc.get("_id").and_then(Value::as_str).is_some_and(|id| wanted.contains(id))
            })
            .collect())
    }
}

/// In-memory build-record store mirroring [`FsBuildStore`]'s layout.
///
/// [`FsBuildStore`]: crate::clients::FsBuildStore
#[derive(Default)]
pub struct MemoryBuildStore {
    docs: Mutex<BTreeMap<String, Value>>,
}

impl MemoryBuildStore {
    pub fn insert_build(&self, doc: Value) {
        let id = doc["_id"].as_str().expect("build has an _id").to_owned();
        self.docs.lock().unwrap().insert(id, doc);
    }

    pub fn build_json(&self, build_id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(build_id).cloned()
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn get_build(&self, build_id: &str) -> Result<Option<BuildDoc>> {
        match self.build_json(build_id) {
            Some(doc) => Ok(Some(BuildDoc::try_from(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_build_for_index(&self, index: &str) -> Result<Option<BuildDoc>> {
        if let Some(build) = self.get_build(index).await? {
            return Ok(Some(build));
        }
        let docs = self.docs.lock().unwrap().clone();
        for doc in docs.values() {
            if slot(doc, &["index", index]).is_some() {
                return Ok(Some(BuildDoc::try_from(doc.clone())?));
            }
        }
        Ok(None)
    }

    async fn read_state(
        &self,
        build_id: &str,
        section: StateSection,
        key: &str,
        step: &str,
    ) -> Result<Option<JobState>> {
        let docs = self.docs.lock().unwrap();
        let Some(doc) = docs.get(build_id) else { return Ok(None) };
        match slot(doc, &[section.as_str(), key, step]) {
            Some(state) => Ok(Some(serde_json::from_value(state.clone())?)),
            None => Ok(None),
        }
    }

    async fn write_state(
        &self,
        build_id: &str,
        section: StateSection,
        key: &str,
        step: &str,
        state: &JobState,
    ) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .get_mut(build_id)
            .ok_or_else(|| Error::BuildNotFound(build_id.to_owned()))?;
        *slot_mut(doc, &[section.as_str(), key, step]) = serde_json::to_value(state)?;
        Ok(())
    }

    async fn write_snapshot_env(&self, build_id: &str, snapshot: &str, env: &str) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .get_mut(build_id)
            .ok_or_else(|| Error::BuildNotFound(build_id.to_owned()))?;
        *slot_mut(doc, &["snapshot", snapshot, "env"]) = Value::String(env.to_owned());
        Ok(())
    }

    async fn prune_transient(&self) -> Result<u64> {
        let mut docs = self.docs.lock().unwrap();
        let mut pruned = 0;
        for doc in docs.values_mut() {
            for section in [StateSection::Index, StateSection::Snapshot] {
                let Some(keys) = doc.get_mut(section.as_str()).and_then(Value::as_object_mut)
                else {
                    continue;
                };
                for record in keys.values_mut() {
                    let Some(steps) = record.as_object_mut() else { continue };
                    for state in steps.values_mut() {
                        if state.get("transient") != Some(&Value::Bool(true)) {
                            continue;
                        }
                        let parsed: JobState = serde_json::from_value(state.clone())?;
                        *state = serde_json::to_value(parsed.cancel())?;
                        pruned += 1;
                    }
                }
            }
        }
        Ok(pruned)
    }
}

/// Runs batches in-process against the in-memory collaborators instead of
/// spawning worker processes.
pub struct TaskDispatcher {
    store: Arc<dyn DocumentStore>,
    engine: Arc<dyn SearchEngine>,
    /// Artificial per-batch latency, to exercise cancellation.
    pub delay: Option<Duration>,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, engine: Arc<dyn SearchEngine>) -> TaskDispatcher {
        TaskDispatcher { store, engine, delay: None }
    }
}

impl Dispatch for TaskDispatcher {
    fn dispatch(&self, descriptor: BatchDescriptor) -> JoinHandle<Result<u64>> {
        let store = Arc::clone(&self.store);
        let engine = Arc::clone(&self.engine);
        let delay = self.delay;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            IndexingTask::new(store, engine, descriptor).run().await
        })
    }
}

pub struct FixedStoreProvider(pub Arc<dyn DocumentStore>);

impl StoreProvider for FixedStoreProvider {
    fn open(&self, _args: &StoreConnArgs) -> Result<Arc<dyn DocumentStore>> {
        Ok(Arc::clone(&self.0))
    }
}

pub struct FixedEngineProvider(pub Arc<dyn SearchEngine>);

impl EngineProvider for FixedEngineProvider {
    fn open(&self, _args: &EngineArgs) -> Result<Arc<dyn SearchEngine>> {
        Ok(Arc::clone(&self.0))
    }
}

/// A fully wired in-memory hub.
pub struct TestHub {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<MemoryEngine>,
    pub builds: Arc<MemoryBuildStore>,
    pub ctx: PipelineContext,
}

pub fn hub() -> TestHub {
    let store = Arc::new(MemoryStore::default());
    let engine = Arc::new(MemoryEngine::default());
    let builds = Arc::new(MemoryBuildStore::default());
    let dispatcher = Arc::new(TaskDispatcher::new(store.clone(), engine.clone()));
    let ctx = PipelineContext {
        build_store: builds.clone(),
        stores: Arc::new(FixedStoreProvider(store.clone())),
        engines: Arc::new(FixedEngineProvider(engine.clone())),
        dispatcher,
        pool: JobPool::new(),
        source: SourceStoreConfig::default(),
    };
    TestHub { store, engine, builds, ctx }
}

/// A registered indexing environment named `name`.
pub fn indexer_env(name: &str) -> IndexerEnv {
    IndexerEnv {
        name: name.to_owned(),
        args: EngineArgs {
            hosts: vec!["http://localhost:9200".to_owned()],
            ..EngineArgs::default()
        },
        ..IndexerEnv::default()
    }
}

/// Seeds `count` documents into `target/<collection>` and a matching build
/// record named after the collection.
pub fn seed_build(hub: &TestHub, collection: &str, count: usize) {
    let docs = (0..count)
        .map(|i| json!({ "_id": format!("{collection}-{i}"), "n": i, "src": collection }))
        .collect();
    hub.store.insert("target", collection, docs);
    hub.builds.insert_build(json!({
        "_id": collection,
        "target_backend": "mongo",
        "target_name": collection,
        "backend_url": collection,
        "build_config": { "name": collection, "doc_type": "news" },
        "mapping": { "n": { "type": "integer" } },
        "_meta": { "build_version": "202105261855" }
    }));
}
