use std::collections::BTreeMap;
use std::sync::Arc;

use indexhub_types::build::BuildDoc;
use indexhub_types::config::{HubConfig, IndexerEnv};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::indexer::{
    BuildIndexer, IndexParams, Indexer, IndexerBuilder, IndexerRegistry, PipelineContext,
    DEFAULT_INDEXER,
};
use crate::pool::JobCategory;
use crate::{Error, Result};

/// One `index` invocation as received from the hub surface.
#[derive(Debug, Clone, Default)]
pub struct IndexRequest {
    pub index_name: Option<String>,
    pub params: IndexParams,
}

/// Environment registry and entry point of the indexing feature: selects an
/// indexer class per build, spawns pipelines, and keeps management
/// operations single-flight.
pub struct IndexManager {
    ctx: PipelineContext,
    config: HubConfig,
    envs: BTreeMap<String, IndexerEnv>,
    registry: IndexerRegistry,
}

impl IndexManager {
    /// Registers the configured environments and prunes lifecycle records
    /// left transient by a previous process.
    pub async fn new(ctx: PipelineContext, config: HubConfig) -> Result<IndexManager> {
        let mut manager = IndexManager {
            ctx,
            config,
            envs: BTreeMap::new(),
            registry: IndexerRegistry::default(),
        };
        manager.clean_stale_status().await?;
        manager.configure();
        Ok(manager)
    }

    /// Promotes every stale transient record to `canceled`.
    pub async fn clean_stale_status(&self) -> Result<u64> {
        let pruned = self.ctx.build_store.prune_transient().await?;
        if pruned > 0 {
            info!(pruned, "promoted stale transient records to canceled");
        }
        Ok(pruned)
    }

    fn configure(&mut self) {
        self.envs = registered_envs(&self.config);
        info!(envs = ?self.envs.keys().collect::<Vec<_>>(), "registered indexer environments");
    }

    pub fn env(&self, name: &str) -> Result<IndexerEnv> {
        self.envs.get(name).cloned().ok_or_else(|| Error::UnknownEnvironment(name.to_owned()))
    }

    pub fn registry_mut(&mut self) -> &mut IndexerRegistry {
        &mut self.registry
    }

    /// Finds the indexer class required to index this build.
    ///
    /// The presence of a dotted path in the build document can determine
    /// the class: every path matching a configured rule is collected, and
    /// exactly one match selects its class. No match (or no rules) falls
    /// back to the default; several matches are ambiguous and refuse.
    fn select_indexer(&self, build: Option<&BuildDoc>) -> Result<Arc<dyn IndexerBuilder>> {
        let select = match &self.config.indexer_select {
            Some(select) => select,
            None => return self.registry.get(DEFAULT_INDEXER),
        };
        let default_name = select.default.as_deref().unwrap_or(DEFAULT_INDEXER);
        let build = match build {
            Some(build) if !select.rules.is_empty() => build,
            _ => return self.registry.get(default_name),
        };

        let mut matched: Vec<String> = Vec::new();
        for path in dotted_paths(&Value::Object(build.0.clone())) {
            if select.rules.contains_key(&path) {
                matched.push(path);
            }
        }
        match matched.as_slice() {
            [] => self.registry.get(default_name),
            [path] => self.registry.get(&select.rules[path]),
            _ => Err(Error::AmbiguousIndexerSelection {
                build: build.id().unwrap_or_default().to_owned(),
                paths: matched,
            }),
        }
    }

    /// Triggers an index creation materializing the build `build_id` into
    /// an index named `request.index_name` (or the build's target name).
    /// Returns the handle of the running pipeline.
    pub async fn index(
        &self,
        env_name: &str,
        build_id: &str,
        request: IndexRequest,
    ) -> Result<JoinHandle<Result<Value>>> {
        let env = self.env(env_name)?;
        let build = self
            .ctx
            .build_store
            .get_build(build_id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_id.to_owned()))?;
        if build.build_config().is_none_or(Map::is_empty) {
            return Err(Error::BuildConfigMissing(build_id.to_owned()));
        }

        let builder = self.select_indexer(Some(&build))?;
        let indexer: Box<dyn BuildIndexer> =
            builder.build(&self.ctx, build, env, request.index_name).await?;
        info!(build = build_id, index = indexer.index_name(), "starting index pipeline");

        let pool = Arc::clone(&self.ctx.pool);
        let params = request.params;
        Ok(tokio::spawn(async move {
            // snapshot creation, publishing and index creation never run
            // concurrently within one manager
            let _guard = pool.acquire(JobCategory::IndexManager, "", 1).await;
            indexer.index(params).await
        }))
    }

    /// The manager config, optionally augmented with the live index and
    /// alias listings of every environment.
    pub async fn index_info(&self, remote: bool) -> Result<Value> {
        let mut conf = serde_json::to_value(&self.config)?;
        if remote {
            for (name, env) in &self.envs {
                let listing = match self.ctx.engines.open(&env.args) {
                    Ok(engine) => engine.list_indices("*").await,
                    Err(err) => Err(err),
                };
                match listing {
                    Ok(indices) => {
                        conf["env"][name]["index"] = indices
                            .into_iter()
                            .map(|(index, aliases)| json!({ "index": index, "aliases": aliases }))
                            .collect();
                    }
                    Err(err) => warn!(env = %name, error = %err, "cannot list indices"),
                }
            }
        }
        Ok(conf)
    }

    /// Dry-runs a mapping by creating a throwaway index with it. The
    /// temporary index is deleted whether creation succeeded or not; the
    /// engine's answer to the creation is returned.
    pub async fn validate_mapping(
        &self,
        mapping: Map<String, Value>,
        env_name: &str,
    ) -> Result<Value> {
        let env = self.env(env_name)?;
        let mut synthetic = Map::new();
        synthetic.insert("mapping".to_owned(), Value::Object(mapping));
        let build = BuildDoc(synthetic);

        let temp_name = format!("hub_tmp_{}", random_suffix()).to_lowercase();
        let indexer = Indexer::new(&self.ctx, &build, env, Some(temp_name.clone()))?;
        debug!(settings = ?indexer.settings(), mappings = ?indexer.mappings());

        let engine = indexer.engine();
        let created = async {
            let version = engine.version().await?;
            let body = json!({
                "settings": indexer.settings().finalize(&version),
                "mappings": indexer.mappings().finalize(&version),
            });
            engine.create_index(&temp_name, &body).await
        }
        .await;
        let deleted = engine.delete_index(&temp_name).await;

        let response = created?;
        deleted?;
        Ok(response)
    }

    /// Patches the live index's `_meta`, either from a named build record
    /// or from a literal value.
    pub async fn update_metadata(
        &self,
        env_name: &str,
        index_name: &str,
        build_name: Option<&str>,
        meta: Option<Value>,
    ) -> Result<Value> {
        let env = self.env(env_name)?;
        let engine = self.ctx.engines.open(&env.args)?;

        // refuse indices that still carry several typed mappings
        let mapping = engine.get_mapping(index_name).await?;
        if let Some(mappings) = mapping[index_name]["mappings"].as_object() {
            let untyped = mappings.is_empty()
                || mappings.contains_key("properties")
                || mappings.contains_key("_meta")
                || mappings.contains_key("dynamic");
            if !untyped && mappings.len() != 1 {
                return Err(Error::Config(format!(
                    "found more than one mapping type in `{index_name}`"
                )));
            }
        }

        let meta = match build_name {
            Some(build_name) => {
                let build = self
                    .ctx
                    .build_store
                    .get_build(build_name)
                    .await?
                    .ok_or_else(|| Error::BuildNotFound(build_name.to_owned()))?;
                build.meta().cloned()
            }
            None => meta,
        };
        let meta = meta.ok_or_else(|| Error::Config("no _meta found".to_owned()))?;
        engine.put_mapping_meta(index_name, &meta).await
    }
}

/// Indexing environments as registered: the name stamped on, the engine
/// hosts defaulted from the environment host.
pub(crate) fn registered_envs(config: &HubConfig) -> BTreeMap<String, IndexerEnv> {
    let mut envs = BTreeMap::new();
    for (name, env) in &config.env {
        let mut indexer = env.indexer.clone();
        indexer.name = name.clone();
        if indexer.args.hosts.is_empty() {
            if let Some(host) = &env.host {
                indexer.args.hosts = vec![host.clone()];
            }
        }
        envs.insert(name.clone(), indexer);
    }
    envs
}

fn random_suffix() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_owned()
}

/// Every dotted path of the document's object tree; arrays are traversed
/// transparently so a rule can match a key nested under a list.
fn dotted_paths(value: &Value) -> Vec<String> {
    fn walk(value: &Value, prefix: &str, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    out.push(path.clone());
                    walk(child, &path, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, prefix, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, "", &mut out);
    out
}
