use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level hub configuration, loadable from a TOML file.
///
/// ```toml
/// [source]
/// uri = "jsonl:./data"
///
/// [env.prod]
/// host = "http://localhost:9200"
///
/// [env.prod.indexer.args]
/// timeout_secs = 300
/// retry_on_timeout = true
/// max_retries = 10
///
/// [env.prod.indexer]
/// concurrency = 3
///
/// [snapshot.env.prod]
/// monitor_delay_secs = 30
/// engine = { env = "prod" }
///
/// [snapshot.env.prod.repository]
/// name = "releases_%(build_config.name)s"
/// type = "s3"
/// settings = { bucket = "hub-releases", region = "us-west-2" }
/// ```
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub source: SourceStoreConfig,
    #[serde(default)]
    pub env: BTreeMap<String, EnvConfig>,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexer_select: Option<IndexerSelect>,
}

/// Connection to the document store holding source collections and build
/// records. Only the URI crosses worker process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStoreConfig {
    pub uri: String,
    #[serde(default = "default_src_db")]
    pub src_db: String,
    #[serde(default = "default_target_db")]
    pub target_db: String,
}

impl Default for SourceStoreConfig {
    fn default() -> Self {
        SourceStoreConfig {
            uri: "jsonl:./data".to_owned(),
            src_db: default_src_db(),
            target_db: default_target_db(),
        }
    }
}

fn default_src_db() -> String {
    "src".to_owned()
}

fn default_target_db() -> String {
    "target".to_owned()
}

/// Serializable document-store connection arguments. The scheme of the URI
/// selects the client implementation (`jsonl:<root>` is bundled).
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConnArgs {
    pub uri: String,
}

/// One indexing environment as written in the config file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Default engine host, used when `indexer.args.hosts` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub indexer: IndexerEnv,
    /// Informational list of indices served by this environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub index: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
}

/// Indexer tuning of one environment: engine client arguments, worker bulk
/// arguments, and the in-flight batch bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerEnv {
    /// Environment name; filled in at registration, not from the file.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default)]
    pub args: EngineArgs,
    #[serde(default)]
    pub bulk: BulkArgs,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IndexerEnv {
    fn default() -> Self {
        IndexerEnv {
            name: String::new(),
            args: EngineArgs::default(),
            bulk: BulkArgs::default(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}

/// Search-engine client arguments, applied per environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineArgs {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl Default for EngineArgs {
    fn default() -> Self {
        EngineArgs {
            hosts: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_on_timeout: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    10
}

/// Worker-side bulk-write arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkArgs {
    /// Number of actions shipped per bulk request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for BulkArgs {
    fn default() -> Self {
        BulkArgs { chunk_size: default_chunk_size() }
    }
}

fn default_chunk_size() -> usize {
    500
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub env: BTreeMap<String, SnapshotEnv>,
}

/// One snapshot environment: which engine to drive, the repository to
/// snapshot into, optional cloud credentials, and the poll interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnv {
    pub engine: EngineRef,
    pub repository: RepositoryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,
    #[serde(default = "default_monitor_delay_secs")]
    pub monitor_delay_secs: u64,
}

fn default_monitor_delay_secs() -> u64 {
    30
}

/// A snapshot environment names its engine exactly one way: by referencing
/// an indexing environment, or by carrying client arguments inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineRef {
    Env { env: String },
    Args(EngineArgs),
}

/// Snapshot repository declaration. The `name` and every string under
/// `settings` may carry `%(key)s` placeholders resolved against the index
/// `_meta` at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RepositoryType,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    S3,
    Fs,
    Gcs,
    Azure,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryType::S3 => "s3",
            RepositoryType::Fs => "fs",
            RepositoryType::Gcs => "gcs",
            RepositoryType::Azure => "azure",
        }
    }
}

/// Cloud credentials for repository reconciliation. Only AWS is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Indexer-class selection rules: dotted paths into the build document
/// mapped to registered indexer names. The `default` field overrides the
/// built-in default class.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerSelect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
}
