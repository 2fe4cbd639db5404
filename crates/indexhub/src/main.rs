use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use index_pipeline::clients::{DefaultStoreProvider, FsBuildStore, HttpEngineProvider};
use index_pipeline::dispatch::{BatchDescriptor, ProcessDispatcher};
use index_pipeline::pool::JobPool;
use index_pipeline::task::IndexingTask;
use index_pipeline::{IndexManager, IndexParams, IndexRequest, PipelineContext, SnapshotManager};
use indexhub_types::config::HubConfig;
use indexhub_types::tasks::{IndexMode, SnapshotStep, Step};
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Parser)]
#[command(author, version, about = "Bulk indexing and snapshot orchestration for the data hub", long_about = None)]
struct Cli {
    /// Path to the hub configuration file.
    #[arg(long, global = true, default_value = "indexhub.toml")]
    config_file: PathBuf,

    /// Directory holding the build records.
    #[arg(long, global = true, default_value = "builds")]
    build_store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Materializes a finished build into a search-engine index.
    Index {
        /// Indexing environment to run against.
        env: String,
        /// Id of the build to index.
        build_id: String,
        /// Destination index name, defaulting to the build's target name.
        #[arg(long)]
        index_name: Option<String>,
        /// Pre-existence policy and write behavior:
        /// index, resume, merge or purge.
        #[arg(long, default_value = "index")]
        mode: String,
        /// Comma-separated subsequence of pre,index,post.
        #[arg(long)]
        steps: Option<String>,
        /// Number of documents per worker batch.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Index only these document ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
    },

    /// Shows the index manager configuration.
    IndexInfo {
        /// Also list the live indices and aliases of every environment.
        #[arg(long)]
        remote: bool,
    },

    /// Dry-runs a mapping by creating (and deleting) a temporary index.
    ValidateMapping {
        /// Indexing environment to validate against.
        env: String,
        /// JSON file holding the field mapping.
        mapping_file: PathBuf,
    },

    /// Patches the `_meta` of a live index.
    UpdateMetadata {
        /// Indexing environment the index lives in.
        env: String,
        /// Name of the live index.
        index: String,
        /// Take `_meta` from this build record.
        #[arg(long, conflicts_with = "meta_file")]
        build_name: Option<String>,
        /// Take `_meta` from this JSON file.
        #[arg(long)]
        meta_file: Option<PathBuf>,
    },

    /// Snapshots an index into its environment's repository.
    Snapshot {
        /// Snapshot environment to run against.
        env: String,
        /// Name of the index to snapshot.
        index: String,
        /// Snapshot name, defaulting to the index name.
        #[arg(long)]
        snapshot: Option<String>,
        /// Comma-separated subsequence of pre,snapshot,post.
        #[arg(long)]
        steps: Option<String>,
    },

    /// Executes one indexing batch read from stdin. Spawned by the hub
    /// itself, once per batch.
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logs go to stderr: the worker's stdout carries its report
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { config_file, build_store, command } = Cli::parse();

    if let Command::Worker = command {
        return worker().await;
    }

    let config = load_config(&config_file)?;
    let ctx = context(&config, build_store)?;

    match command {
        Command::Index { env, build_id, index_name, mode, steps, batch_size, ids } => {
            let params = IndexParams {
                steps: steps.as_deref().map(parse_list::<Step>).transpose()?,
                batch_size,
                mode: IndexMode::from_str(&mode)?,
                ids,
            };
            let manager = IndexManager::new(ctx, config).await?;
            let handle =
                manager.index(&env, &build_id, IndexRequest { index_name, params }).await?;
            let result = handle.await??;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::IndexInfo { remote } => {
            let manager = IndexManager::new(ctx, config).await?;
            let info = manager.index_info(remote).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::ValidateMapping { env, mapping_file } => {
            let mapping = read_json(&mapping_file)?;
            let Some(mapping) = mapping.as_object() else {
                bail!("{} does not hold a JSON object", mapping_file.display());
            };
            let manager = IndexManager::new(ctx, config).await?;
            let response = manager.validate_mapping(mapping.clone(), &env).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::UpdateMetadata { env, index, build_name, meta_file } => {
            let meta = meta_file.as_deref().map(read_json).transpose()?;
            let manager = IndexManager::new(ctx, config).await?;
            let response =
                manager.update_metadata(&env, &index, build_name.as_deref(), meta).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Snapshot { env, index, snapshot, steps } => {
            let steps = steps.as_deref().map(parse_list::<SnapshotStep>).transpose()?;
            let manager = SnapshotManager::new(ctx, &config)?;
            let handle = manager.snapshot(&env, &index, snapshot, steps).await?;
            let state = handle.await??;
            println!("{state}");
        }
        Command::Worker => unreachable!("handled above"),
    }
    Ok(())
}

/// Reads a batch descriptor off stdin, runs it, and reports on stdout.
async fn worker() -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading the batch descriptor from stdin")?;
    let descriptor: BatchDescriptor =
        serde_json::from_str(&input).context("decoding the batch descriptor")?;
    debug!(batch = descriptor.batch_num, index = %descriptor.dest_index, "worker starting");
    let report = IndexingTask::run_from_descriptor(descriptor).await?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<HubConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading the configuration at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn context(config: &HubConfig, build_store: PathBuf) -> anyhow::Result<PipelineContext> {
    Ok(PipelineContext {
        build_store: Arc::new(FsBuildStore::new(build_store)),
        stores: Arc::new(DefaultStoreProvider),
        engines: Arc::new(HttpEngineProvider),
        dispatcher: Arc::new(ProcessDispatcher::current_exe()?),
        pool: JobPool::new(),
        source: config.source.clone(),
    })
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_list<T>(list: &str) -> anyhow::Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    list.split(',').map(|item| Ok(item.trim().parse::<T>()?)).collect()
}
