//! The indexing pipeline: one [`Indexer`] per `(source collection,
//! destination index)` pair, a [`ColdHotIndexer`] composing two of them over
//! a shared destination, and the registry resolving configured indexer
//! names to constructors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use indexhub_types::build::{BuildDoc, BuildError, SourceBackend};
use indexhub_types::config::{IndexerEnv, SourceStoreConfig};
use indexhub_types::merge::deep_merge;
use indexhub_types::settings::{IndexMappings, IndexSettings};
use indexhub_types::tasks::{truncate_error, IndexMode, Step};
use serde_json::{json, Map, Value};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::clients::{BuildStore, EngineProvider, SearchEngine, StoreProvider};
use crate::dispatch::{BatchDescriptor, Dispatch};
use crate::pool::{JobCategory, JobPool, JobPermit};
use crate::registrar::JobStateRegistrar;
use crate::schedule::Schedule;
use crate::{Error, Result};

#[cfg(test)]
mod test;

/// Name under which the plain [`Indexer`] is registered.
pub const DEFAULT_INDEXER: &str = "default";
/// Name under which the [`ColdHotIndexer`] is registered.
pub const COLD_HOT_INDEXER: &str = "cold_hot";

/// Shared handles every indexer is built from: the stores, the engine and
/// dispatcher factories, the live job table, and the source-store defaults.
#[derive(Clone)]
pub struct PipelineContext {
    pub build_store: Arc<dyn BuildStore>,
    pub stores: Arc<dyn StoreProvider>,
    pub engines: Arc<dyn EngineProvider>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub pool: Arc<JobPool>,
    pub source: SourceStoreConfig,
}

/// Caller-facing parameters of one `index` call. `steps` left to `None`
/// picks the indexer's own default sequence.
#[derive(Debug, Clone, Default)]
pub struct IndexParams {
    pub steps: Option<Vec<Step>>,
    pub batch_size: Option<usize>,
    pub mode: IndexMode,
    pub ids: Option<Vec<String>>,
}

impl IndexParams {
    // The batch size controls only task partitioning; larger than 10000
    // exceeds the engine result window, smaller than 50 amplifies the
    // scheduling overhead per request.
    const MIN_BATCH_SIZE: usize = 50;
    const MAX_BATCH_SIZE: usize = 10_000;

    fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(Self::MAX_BATCH_SIZE)
    }

    /// Validates the parameters, resolving `steps` against the given
    /// default. Runs before any state is written.
    fn resolve(&self, default_steps: &[Step]) -> Result<(Vec<Step>, usize)> {
        let batch_size = self.batch_size();
        if !(Self::MIN_BATCH_SIZE..=Self::MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(Error::BatchSizeOutOfRange(batch_size));
        }
        let steps = self.steps.clone().unwrap_or_else(|| default_steps.to_vec());
        if steps.is_empty() {
            return Err(Error::EmptySteps);
        }
        let ordered = steps.windows(2).all(|pair| rank(pair[0]) < rank(pair[1]));
        if !ordered {
            return Err(Error::InvalidSteps);
        }
        Ok((steps, batch_size))
    }
}

fn rank(step: Step) -> u8 {
    match step {
        Step::Pre => 0,
        Step::Index => 1,
        Step::Post => 2,
    }
}

/// Object-safe surface the manager drives, implemented by both indexer
/// flavors.
#[async_trait]
pub trait BuildIndexer: Send + Sync {
    fn index_name(&self) -> &str;
    async fn index(&self, params: IndexParams) -> Result<Value>;
}

/// Document store -> search engine indexer for one build.
pub struct Indexer {
    stores: Arc<dyn StoreProvider>,
    dispatcher: Arc<dyn Dispatch>,
    pool: Arc<JobPool>,
    engine: Arc<dyn SearchEngine>,
    registrar: JobStateRegistrar,
    source: Option<SourceBackend>,
    env: IndexerEnv,
    index_name: String,
    settings: IndexSettings,
    mappings: IndexMappings,
    target_name: String,
}

impl Indexer {
    pub fn new(
        ctx: &PipelineContext,
        build: &BuildDoc,
        env: IndexerEnv,
        index_name: Option<String>,
    ) -> Result<Indexer> {
        // The build primarily describes the source collection, the
        // environment primarily describes the destination index.
        let source = build.parse_backend(&ctx.source)?;
        let target_name = build
            .target_name()
            .map(str::to_owned)
            .or_else(|| index_name.clone())
            .ok_or_else(|| Error::Config("a build without a name needs an index name".into()))?;
        let index_name = index_name.unwrap_or_else(|| target_name.clone());

        let mut settings = IndexSettings::default();
        settings.enrich(build);
        let mut mappings = IndexMappings::default();
        mappings.enrich(build);

        let build_id = build.id().unwrap_or(&target_name).to_owned();
        let registrar = JobStateRegistrar::index(ctx.build_store.clone(), &build_id, &index_name);

        Ok(Indexer {
            stores: ctx.stores.clone(),
            dispatcher: ctx.dispatcher.clone(),
            pool: ctx.pool.clone(),
            engine: ctx.engines.open(&env.args)?,
            registrar,
            source,
            env,
            index_name,
            settings,
            mappings,
            target_name,
        })
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn mappings(&self) -> &IndexMappings {
        &self.mappings
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngine> {
        &self.engine
    }

    /// Runs the requested steps in order, recording each one's lifecycle
    /// in the build record. Partial results of completed steps stay
    /// persisted even when a later step fails; the first failure is
    /// re-raised after being recorded.
    pub async fn run(&self, params: IndexParams) -> Result<Value> {
        let (steps, batch_size) = params.resolve(&[Step::Pre, Step::Index, Step::Post])?;

        let mut merged = Map::new();
        for step in steps {
            info!(step = %step, source = %self.target_name, dest = %self.index_name, "running step");
            self.registrar.started(step.as_str()).await?;
            let outcome = match step {
                Step::Pre => self.pre_index(params.mode).await,
                Step::Index => self.do_index(batch_size, params.mode, params.ids.as_deref()).await,
                Step::Post => self.post_index().await,
            };
            match outcome {
                Ok(partial) => {
                    let mut acc = Value::Object(std::mem::take(&mut merged));
                    deep_merge(&mut acc, &Value::Object(partial));
                    let Value::Object(acc) = acc else { unreachable!() };
                    merged = acc;
                    self.registrar
                        .succeeded(step.as_str(), self.keyed_result(&merged))
                        .await?;
                }
                Err(err) => {
                    let message = truncate_error(&err.to_string());
                    warn!(step = %step, error = %message, "step failed");
                    if let Err(record_err) = self.registrar.failed(step.as_str(), &message).await {
                        warn!(error = %record_err, "could not record the failure");
                    }
                    return Err(err);
                }
            }
        }
        Ok(self.keyed_result(&merged))
    }

    /// Result shape surfaced to callers and the registrar:
    /// `{ <dest index>: { count: N, ... } }`.
    fn keyed_result(&self, merged: &Map<String, Value>) -> Value {
        let mut keyed = Map::new();
        keyed.insert(self.index_name.clone(), Value::Object(merged.clone()));
        Value::Object(keyed)
    }

    /// Asserts or establishes the destination index according to the mode.
    async fn pre_index(&self, mode: IndexMode) -> Result<Map<String, Value>> {
        match mode {
            IndexMode::Index => {
                // index MUST NOT exist
                if self.engine.index_exists(&self.index_name).await? {
                    return Err(Error::IndexAlreadyExists(self.index_name.clone()));
                }
            }
            IndexMode::Resume | IndexMode::Merge => {
                // index MUST exist, creation is skipped
                if !self.engine.index_exists(&self.index_name).await? {
                    return Err(Error::IndexMissing(self.index_name.clone()));
                }
                info!(index = %self.index_name, "index exists");
                return Ok(Map::new());
            }
            IndexMode::Purge => {
                // index MAY exist
                let response = self.engine.delete_index(&self.index_name).await?;
                info!(index = %self.index_name, response = %response, "deleted index");
            }
        }

        let version = self.engine.version().await?;
        let body = json!({
            "settings": self.settings.finalize(&version),
            "mappings": self.mappings.finalize(&version),
        });
        let response = self.engine.create_index(&self.index_name, &body).await?;
        info!(index = %self.index_name, response = %response, "created index");
        Ok(Map::new())
    }

    /// Partitions the source ids into batches and fans them out to worker
    /// processes, bounded by the environment's concurrency. The first batch
    /// failure cancels every still-pending batch and fails the step.
    async fn do_index(
        &self,
        batch_size: usize,
        mode: IndexMode,
        ids: Option<&[String]>,
    ) -> Result<Map<String, Value>> {
        let source = self.source.as_ref().ok_or_else(|| {
            Error::Config(format!("build `{}` has no source backend", self.target_name))
        })?;
        let store = self.stores.open(&source.conn)?;
        let collections = store.list_collections(&source.db).await?;
        if !collections.contains(&source.collection) {
            return Err(Error::SourceCollectionMissing {
                db: source.db.clone(),
                collection: source.collection.clone(),
            });
        }

        let total = match ids {
            Some(ids) => ids.len() as u64,
            None => store.count(&source.db, &source.collection).await?,
        };
        let schedule = Arc::new(Schedule::new(total, batch_size as u64));
        info!(
            collection = %source.collection,
            total,
            batch_size,
            "creating indexer jobs"
        );

        let mut id_batches: BoxStream<'static, Result<Vec<String>>> = match ids {
            // ids supplied by the caller, chunked locally
            Some(ids) => futures::stream::iter(
                ids.chunks(batch_size).map(|chunk| Ok(chunk.to_vec())).collect::<Vec<_>>(),
            )
            .boxed(),
            // ids fed from the source collection
            None => store.id_batches(&source.db, &source.collection, batch_size),
        };

        let first_error: Arc<Mutex<Option<Error>>> = Arc::default();
        let mut aborts: Vec<AbortHandle> = Vec::new();
        let mut monitors: Vec<JoinHandle<()>> = Vec::new();
        let mut stream_error = None;

        while let Some(next) = id_batches.next().await {
            let batch_ids = match next {
                Ok(batch_ids) => batch_ids,
                Err(err) => {
                    stream_error = Some(err);
                    break;
                }
            };
            let Some(batch_num) = schedule.draw() else { break };

            tokio::task::yield_now().await;

            // When one batch failed and scheduling has not completed, stop
            // scheduling and cancel all on-going jobs, to fail quickly.
            if first_error.lock().unwrap().is_some() {
                break;
            }

            info!(batch = batch_num, schedule = %schedule, "dispatching batch");

            let permit = self
                .pool
                .acquire(JobCategory::Indexer, &self.env.name, self.env.concurrency.max(1))
                .await;
            let descriptor = BatchDescriptor {
                source_conn: source.conn.clone(),
                source_db: source.db.clone(),
                source_collection: source.collection.clone(),
                engine_args: self.env.args.clone(),
                bulk_args: self.env.bulk.clone(),
                dest_index: self.index_name.clone(),
                ids: batch_ids,
                mode,
                batch_num,
            };
            let handle = self.dispatcher.dispatch(descriptor);
            aborts.push(handle.abort_handle());
            monitors.push(tokio::spawn(batch_finished(
                handle,
                permit,
                batch_num,
                Arc::clone(&schedule),
                Arc::clone(&first_error),
            )));
        }

        if stream_error.is_some() || first_error.lock().unwrap().is_some() {
            for abort in &aborts {
                abort.abort();
            }
        }
        futures::future::join_all(monitors).await;

        if let Some(err) = stream_error {
            return Err(err);
        }
        if let Some(err) = first_error.lock().unwrap().take() {
            return Err(err);
        }

        info!(schedule = %schedule, "all batches finished");
        let mut result = Map::new();
        result.insert("count".into(), json!(total));
        Ok(result)
    }

    /// Extension point for warmup, alias flips, refresh toggles.
    pub async fn post_index(&self) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

/// Completion callback of one dispatched batch: credits the schedule on
/// success, records the first error on failure, and lets a cancellation
/// pass without progressing anything. Releases the admission permit either
/// way.
async fn batch_finished(
    handle: JoinHandle<Result<u64>>,
    permit: JobPermit,
    batch_num: u64,
    schedule: Arc<Schedule>,
    first_error: Arc<Mutex<Option<Error>>>,
) {
    let outcome = handle.await;
    drop(permit);
    match outcome {
        Ok(Ok(count)) => {
            schedule.record_finished(count);
            debug!(batch = batch_num, count, "batch finished");
        }
        Ok(Err(err)) => {
            warn!(batch = batch_num, error = %err, "batch failed");
            let err = match err {
                err @ Error::BatchFailed { .. } => err,
                other => Error::BatchFailed { batch: batch_num, message: other.to_string() },
            };
            record_first_error(&first_error, err);
        }
        Err(join_err) if join_err.is_cancelled() => {
            debug!(batch = batch_num, "batch canceled");
        }
        Err(join_err) => {
            record_first_error(
                &first_error,
                Error::BatchFailed { batch: batch_num, message: join_err.to_string() },
            );
        }
    }
}

fn record_first_error(first_error: &Mutex<Option<Error>>, err: Error) {
    let mut slot = first_error.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[async_trait]
impl BuildIndexer for Indexer {
    fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn index(&self, params: IndexParams) -> Result<Value> {
        self.run(params).await
    }
}

/// Two indexers over one destination index: a static cold collection indexed
/// first, then a frequently-updated hot collection merged on top. The caller
/// observes a single logical index; the cold collection stays hidden.
pub struct ColdHotIndexer {
    cold: Indexer,
    hot: Indexer,
}

impl std::fmt::Debug for ColdHotIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdHotIndexer").finish_non_exhaustive()
    }
}

impl ColdHotIndexer {
    pub async fn new(
        ctx: &PipelineContext,
        hot_build: BuildDoc,
        env: IndexerEnv,
        index_name: Option<String>,
    ) -> Result<ColdHotIndexer> {
        let cold_id = hot_build
            .cold_collection()
            .map(str::to_owned)
            .ok_or_else(|| {
                BuildError::MissingColdCollection(
                    hot_build.id().unwrap_or_default().to_owned(),
                )
            })?;
        let cold_doc = ctx
            .build_store
            .get_build(&cold_id)
            .await?
            .ok_or(Error::BuildNotFound(cold_id))?;
        let cold_build = hot_build.compose_cold(cold_doc);

        let hot = Indexer::new(ctx, &hot_build, env.clone(), index_name)?;
        let cold = Indexer::new(ctx, &cold_build, env, Some(hot.index_name().to_owned()))?;
        Ok(ColdHotIndexer { cold, hot })
    }

    /// Indexes the cold collection (creating the index), then completes it
    /// with the hot collection. Hot always runs in `merge` mode: the index
    /// exists by then, so `index` mode would refuse it.
    pub async fn run(&self, params: IndexParams) -> Result<Value> {
        let (steps, _) = params.resolve(&[Step::Index, Step::Post])?;

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        if steps.contains(&Step::Index) {
            let cold_params = IndexParams {
                steps: Some(vec![Step::Pre, Step::Index]),
                batch_size: params.batch_size,
                mode: params.mode,
                ids: params.ids.clone(),
            };
            merge_counts(&mut counts, self.cold.run(cold_params).await?);

            let hot_params = IndexParams {
                steps: Some(vec![Step::Index]),
                batch_size: params.batch_size,
                mode: IndexMode::Merge,
                ids: params.ids.clone(),
            };
            merge_counts(&mut counts, self.hot.run(hot_params).await?);
        }
        if steps.contains(&Step::Post) {
            // only the hot indexer's hook runs, as the outside entry point
            self.hot.post_index().await?;
        }
        Ok(serde_json::to_value(counts)?)
    }
}

/// Folds an indexer result (`{index: {count: n}}`) into a cumulative
/// `{index -> count}` map, summing same-keyed entries.
fn merge_counts(counts: &mut BTreeMap<String, u64>, result: Value) {
    if let Value::Object(entries) = result {
        for (index, body) in entries {
            let count = body.get("count").and_then(Value::as_u64).unwrap_or(0);
            *counts.entry(index).or_insert(0) += count;
        }
    }
}

#[async_trait]
impl BuildIndexer for ColdHotIndexer {
    fn index_name(&self) -> &str {
        self.hot.index_name()
    }

    async fn index(&self, params: IndexParams) -> Result<Value> {
        self.run(params).await
    }
}

/// Builds one indexer flavor out of a build record and an environment.
#[async_trait]
pub trait IndexerBuilder: Send + Sync + std::fmt::Debug {
    async fn build(
        &self,
        ctx: &PipelineContext,
        build: BuildDoc,
        env: IndexerEnv,
        index_name: Option<String>,
    ) -> Result<Box<dyn BuildIndexer>>;
}

#[derive(Debug)]
struct DefaultIndexerBuilder;

#[async_trait]
impl IndexerBuilder for DefaultIndexerBuilder {
    async fn build(
        &self,
        ctx: &PipelineContext,
        build: BuildDoc,
        env: IndexerEnv,
        index_name: Option<String>,
    ) -> Result<Box<dyn BuildIndexer>> {
        Ok(Box::new(Indexer::new(ctx, &build, env, index_name)?))
    }
}

#[derive(Debug)]
struct ColdHotIndexerBuilder;

#[async_trait]
impl IndexerBuilder for ColdHotIndexerBuilder {
    async fn build(
        &self,
        ctx: &PipelineContext,
        build: BuildDoc,
        env: IndexerEnv,
        index_name: Option<String>,
    ) -> Result<Box<dyn BuildIndexer>> {
        Ok(Box::new(ColdHotIndexer::new(ctx, build, env, index_name).await?))
    }
}

/// Compile-time registry resolving configured indexer names to
/// constructors; registration happens at build time, not through dynamic
/// loading.
pub struct IndexerRegistry {
    builders: BTreeMap<String, Arc<dyn IndexerBuilder>>,
}

impl Default for IndexerRegistry {
    fn default() -> Self {
        let mut registry = IndexerRegistry { builders: BTreeMap::new() };
        registry.register(DEFAULT_INDEXER, Arc::new(DefaultIndexerBuilder));
        registry.register(COLD_HOT_INDEXER, Arc::new(ColdHotIndexerBuilder));
        registry
    }
}

impl IndexerRegistry {
    pub fn register(&mut self, name: impl Into<String>, builder: Arc<dyn IndexerBuilder>) {
        self.builders.insert(name.into(), builder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn IndexerBuilder>> {
        self.builders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no indexer registered under `{name}`")))
    }
}
