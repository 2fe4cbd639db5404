use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{SourceStoreConfig, StoreConnArgs};
use crate::merge::deep_merge;

/// A build under the hub's build collection: the durable descriptor of a
/// finalized document set, plus the lifecycle sub-records the pipeline
/// appends under its `index` and `snapshot` keys.
///
/// ```json
/// {
///     "_id": "mynews_202105261855_5ffxvchx",
///     "target_backend": "mongo",
///     "target_name": "mynews_202105261855_5ffxvchx",
///     "backend_url": "mynews_202105261855_5ffxvchx",
///     "build_config": { "name": "mynews", "doc_type": "news" },
///     "mapping": { "author": { "type": "text" } },
///     "_meta": { "build_version": "202105261855" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDoc(pub Map<String, Value>);

impl TryFrom<Value> for BuildDoc {
    type Error = BuildError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(BuildDoc(map)),
            other => Err(BuildError::NotAnObject(other.to_string())),
        }
    }
}

impl BuildDoc {
    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    /// The name of the build, falling back to its `_id`.
    pub fn target_name(&self) -> Option<&str> {
        self.0.get("target_name").and_then(Value::as_str).or_else(|| self.id())
    }

    pub fn build_config(&self) -> Option<&Map<String, Value>> {
        self.0.get("build_config").and_then(Value::as_object)
    }

    pub fn conf_name(&self) -> Option<&str> {
        self.build_config().and_then(|c| c.get("name")).and_then(Value::as_str)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.build_config().and_then(|c| c.get("doc_type")).and_then(Value::as_str)
    }

    pub fn cold_collection(&self) -> Option<&str> {
        self.build_config().and_then(|c| c.get("cold_collection")).and_then(Value::as_str)
    }

    pub fn num_shards(&self) -> u64 {
        self.build_config().and_then(|c| c.get("num_shards")).and_then(Value::as_u64).unwrap_or(1)
    }

    pub fn num_replicas(&self) -> u64 {
        self.build_config().and_then(|c| c.get("num_replicas")).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn mapping(&self) -> Option<&Map<String, Value>> {
        self.0.get("mapping").and_then(Value::as_object)
    }

    pub fn meta(&self) -> Option<&Value> {
        self.0.get("_meta")
    }

    /// Resolves the source collection this build materializes from.
    ///
    /// `mongo` reads the collection named by `backend_url` out of the target
    /// database; `link` names the database kind explicitly through a
    /// `[kind, collection]` pair. A build without a `target_backend` (such as
    /// the synthetic one used for mapping validation) has no source.
    pub fn parse_backend(
        &self,
        source: &SourceStoreConfig,
    ) -> Result<Option<SourceBackend>, BuildError> {
        let backend = match self.0.get("target_backend").and_then(Value::as_str) {
            None => return Ok(None),
            Some(backend) => backend,
        };
        let url = self.0.get("backend_url");
        match (backend, url) {
            ("mongo", Some(Value::String(collection))) => Ok(Some(SourceBackend {
                conn: StoreConnArgs { uri: source.uri.clone() },
                db: source.target_db.clone(),
                collection: collection.clone(),
            })),
            ("link", Some(Value::Array(pair))) => {
                let kind = pair.first().and_then(Value::as_str);
                let collection = pair.get(1).and_then(Value::as_str);
                match (kind, collection) {
                    (Some(kind @ ("src" | "target")), Some(collection)) => Ok(Some(SourceBackend {
                        conn: StoreConnArgs { uri: source.uri.clone() },
                        db: if kind == "src" {
                            source.src_db.clone()
                        } else {
                            source.target_db.clone()
                        },
                        collection: collection.to_owned(),
                    })),
                    _ => Err(self.backend_error(backend, url)),
                }
            }
            _ => Err(self.backend_error(backend, url)),
        }
    }

    fn backend_error(&self, backend: &str, url: Option<&Value>) -> BuildError {
        BuildError::UnsupportedBackend {
            backend: backend.to_owned(),
            url: url.cloned().unwrap_or(Value::Null).to_string(),
        }
    }

    /// Builds the cold counterpart of a cold/hot pair from the raw cold
    /// build document: the hot mapping is unioned over the cold one (hot
    /// wins on conflicts) and `_meta` is deep-merged the same way.
    pub fn compose_cold(&self, cold: BuildDoc) -> BuildDoc {
        let mut cold = cold;
        let mut mapping = cold.mapping().cloned().unwrap_or_default();
        if let Some(hot_mapping) = self.mapping() {
            for (field, spec) in hot_mapping {
                mapping.insert(field.clone(), spec.clone());
            }
        }
        cold.0.insert("mapping".into(), Value::Object(mapping));

        let mut meta = cold.meta().cloned().unwrap_or_else(|| Value::Object(Map::new()));
        if let Some(hot_meta) = self.meta() {
            deep_merge(&mut meta, hot_meta);
        }
        cold.0.insert("_meta".into(), meta);
        cold
    }
}

/// Where a build's documents live: connection arguments plus the database
/// and collection names. Carries only primitives so it can cross a worker
/// process boundary inside a batch descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBackend {
    pub conn: StoreConnArgs,
    pub db: String,
    pub collection: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a build record must be a JSON object, got `{0}`")]
    NotAnObject(String),
    #[error("unsupported build backend `{backend}` with url {url}")]
    UnsupportedBackend { backend: String, url: String },
    #[error("build `{0}` has no `cold_collection` in its build config")]
    MissingColdCollection(String),
}
