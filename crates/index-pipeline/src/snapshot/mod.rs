//! Snapshot orchestration: per-environment [`Snapshooter`] drivers running
//! the `pre`, `snapshot`, `post` steps against a reconciled repository, and
//! the [`SnapshotManager`] registering environments and spawning runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use indexhub_types::config::{EngineRef, HubConfig, IndexerEnv, SnapshotConfig, SnapshotEnv};
use indexhub_types::tasks::{truncate_error, SnapshotStep};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clients::{BuildStore, SearchEngine, SnapshotState, SnapshotStatus};
use crate::indexer::PipelineContext;
use crate::pool::JobCategory;
use crate::registrar::JobStateRegistrar;
use crate::{Error, Result};

pub mod repository;


/// Drives one snapshot run in one environment: repository reconciliation,
/// asynchronous snapshot kickoff, completion polling, and per-step status
/// registration under `snapshot.<name>` of the owning build record.
pub struct Snapshooter {
    env_name: String,
    conf: SnapshotEnv,
    engine: Arc<dyn SearchEngine>,
    build_store: Arc<dyn BuildStore>,
    http: reqwest::Client,
}

impl Snapshooter {
    pub fn new(
        env_name: impl Into<String>,
        conf: SnapshotEnv,
        engine: Arc<dyn SearchEngine>,
        build_store: Arc<dyn BuildStore>,
    ) -> Snapshooter {
        Snapshooter {
            env_name: env_name.into(),
            conf,
            engine,
            build_store,
            http: reqwest::Client::new(),
        }
    }

    /// Creates a snapshot of `index` named `snapshot` (the index name by
    /// default). Steps run in order; the first failure is recorded and
    /// re-raised, skipping the remaining steps. Resolves with the final
    /// snapshot state (`"success"`).
    pub async fn snapshot(
        &self,
        index: &str,
        snapshot: Option<&str>,
        steps: Option<Vec<SnapshotStep>>,
    ) -> Result<String> {
        let steps = steps.unwrap_or_else(|| {
            vec![SnapshotStep::Pre, SnapshotStep::Snapshot, SnapshotStep::Post]
        });
        let snapshot_name = snapshot.unwrap_or(index).to_owned();

        // releasers work off a build document, so one must exist
        let build = self
            .build_store
            .find_build_for_index(index)
            .await?
            .ok_or_else(|| {
                Error::Config(format!("no build document could be found for `{index}`"))
            })?;
        let build_id = build
            .id()
            .ok_or_else(|| Error::Config("build document has no `_id`".to_owned()))?
            .to_owned();
        let registrar =
            JobStateRegistrar::snapshot(self.build_store.clone(), &build_id, &snapshot_name);
        self.build_store.write_snapshot_env(&build_id, &snapshot_name, &self.env_name).await?;

        // the repository is templated against the live index's _meta
        let mapping = self.engine.get_mapping(index).await?;
        let index_meta = mapping[index]["mappings"]["_meta"]
            .as_object()
            .cloned()
            .unwrap_or_default();
        let repo_conf = repository::expand_repository(&self.conf.repository, &index_meta)?;
        repository::ensure_repository(
            self.engine.as_ref(),
            &self.http,
            &repo_conf,
            self.conf.cloud.as_ref(),
        )
        .await?;

        let mut final_state = String::new();
        for step in steps {
            info!(step = %step, index, snapshot = %snapshot_name, "running snapshot step");
            registrar.started(step.as_str()).await?;
            let outcome = match step {
                SnapshotStep::Pre => self.pre_snapshot().await,
                SnapshotStep::Snapshot => {
                    match self.do_snapshot(index, &snapshot_name, &repo_conf.name).await {
                        Ok(state) => {
                            final_state.clone_from(&state);
                            Ok(json!({ "state": state, "repository": repo_conf.clone() }))
                        }
                        Err(err) => Err(err),
                    }
                }
                SnapshotStep::Post => self.post_snapshot().await,
            };
            match outcome {
                Ok(result) => registrar.succeeded(step.as_str(), result).await?,
                Err(err) => {
                    let message = truncate_error(&err.to_string());
                    warn!(step = %step, error = %message, "snapshot step failed");
                    if let Err(record_err) = registrar.failed(step.as_str(), &message).await {
                        warn!(error = %record_err, "could not record the failure");
                    }
                    return Err(err);
                }
            }
        }
        Ok(final_state)
    }

    /// Extension hook run before the snapshot.
    async fn pre_snapshot(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Extension hook run after a successful snapshot.
    async fn post_snapshot(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Kicks the snapshot off and polls its status every `monitor_delay`
    /// until it reaches a terminal state. Success with failed shards is a
    /// partial failure.
    async fn do_snapshot(&self, index: &str, snapshot: &str, repository: &str) -> Result<String> {
        info!(index, snapshot, repository, "creating snapshot");
        self.engine.create_snapshot(repository, snapshot).await?;

        let delay = Duration::from_secs(self.conf.monitor_delay_secs);
        loop {
            let status = match self.engine.snapshot_status(repository, snapshot).await {
                Ok(status) => status,
                Err(err) => {
                    // an unreadable status counts as a failure
                    warn!(snapshot, error = %err, "cannot read snapshot status");
                    SnapshotStatus { state: SnapshotState::Failed, failed_shards: 0 }
                }
            };
            if status.state.is_running() {
                tokio::time::sleep(delay).await;
                continue;
            }
            return match (status.state, status.failed_shards) {
                (SnapshotState::Success, 0) => {
                    info!(snapshot, repository, "snapshot successfully created");
                    Ok("success".to_owned())
                }
                (SnapshotState::Success, failed_shards) => Err(Error::SnapshotPartial {
                    snapshot: snapshot.to_owned(),
                    state: SnapshotState::Success.as_str().to_owned(),
                    failed_shards,
                }),
                (state, _) => Err(Error::SnapshotFailed {
                    snapshot: snapshot.to_owned(),
                    state: state.as_str().to_owned(),
                }),
            };
        }
    }
}

/// Registers snapshot environments and spawns [`Snapshooter`] runs under
/// the manager single-flight guard.
pub struct SnapshotManager {
    ctx: PipelineContext,
    config: SnapshotConfig,
    index_envs: BTreeMap<String, IndexerEnv>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager").finish_non_exhaustive()
    }
}

impl SnapshotManager {
    /// Validates every environment at configure time: only the AWS cloud is
    /// supported, and an engine reference must name a registered indexing
    /// environment.
    pub fn new(ctx: PipelineContext, config: &HubConfig) -> Result<SnapshotManager> {
        for (name, env) in &config.snapshot.env {
            if let Some(cloud) = &env.cloud {
                if cloud.kind != "aws" {
                    return Err(Error::Config(format!(
                        "snapshot environment `{name}`: only the `aws` cloud is supported, \
                         got `{}`",
                        cloud.kind
                    )));
                }
            }
            if let EngineRef::Env { env: referenced } = &env.engine {
                if !config.env.contains_key(referenced) {
                    return Err(Error::Config(format!(
                        "snapshot environment `{name}` references unknown indexing \
                         environment `{referenced}`"
                    )));
                }
            }
        }
        let index_envs = crate::manager::registered_envs(config);
        Ok(SnapshotManager { ctx, config: config.snapshot.clone(), index_envs })
    }

    /// An instance of a snapshooter for the environment named `env`.
    pub fn snapshooter(&self, env_name: &str) -> Result<Snapshooter> {
        let conf = self
            .config
            .env
            .get(env_name)
            .ok_or_else(|| Error::UnknownEnvironment(env_name.to_owned()))?;
        let args = match &conf.engine {
            EngineRef::Env { env } => self
                .index_envs
                .get(env)
                .ok_or_else(|| Error::UnknownEnvironment(env.clone()))?
                .args
                .clone(),
            EngineRef::Args(args) => args.clone(),
        };
        let engine = self.ctx.engines.open(&args)?;
        Ok(Snapshooter::new(env_name, conf.clone(), engine, self.ctx.build_store.clone()))
    }

    /// Spawns a snapshot of `index` in the environment `env_name`; returns
    /// the handle of the running driver.
    pub async fn snapshot(
        &self,
        env_name: &str,
        index: &str,
        snapshot: Option<String>,
        steps: Option<Vec<SnapshotStep>>,
    ) -> Result<JoinHandle<Result<String>>> {
        let snapshooter = self.snapshooter(env_name)?;
        let pool = Arc::clone(&self.ctx.pool);
        let index = index.to_owned();
        Ok(tokio::spawn(async move {
            // serialized with the other management operations
            let _guard = pool.acquire(JobCategory::IndexManager, "", 1).await;
            snapshooter.snapshot(&index, snapshot.as_deref(), steps).await
        }))
    }
}
