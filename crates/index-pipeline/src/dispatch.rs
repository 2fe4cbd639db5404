use std::path::PathBuf;
use std::process::Stdio;

use indexhub_types::config::{BulkArgs, EngineArgs, StoreConnArgs};
use indexhub_types::tasks::IndexMode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Error, Result};

/// Everything a worker process needs to index one batch. Crosses the
/// process boundary as JSON, so only primitive fields: clients are reopened
/// on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDescriptor {
    pub source_conn: StoreConnArgs,
    pub source_db: String,
    pub source_collection: String,
    pub engine_args: EngineArgs,
    pub bulk_args: BulkArgs,
    pub dest_index: String,
    pub ids: Vec<String>,
    pub mode: IndexMode,
    pub batch_num: u64,
}

/// What a worker prints on stdout when its batch is done.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub indexed: u64,
}

/// Hands batches to workers and returns an abortable handle per batch.
///
/// The handle resolves with the worker's indexed count; aborting it cancels
/// a pending batch (and kills an already-spawned worker process).
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, descriptor: BatchDescriptor) -> JoinHandle<Result<u64>>;
}

/// Runs each batch in a child process: the descriptor goes in on stdin, the
/// report comes back on stdout, stderr is kept for the failure message.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessDispatcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> ProcessDispatcher {
        ProcessDispatcher { program: program.into(), args }
    }

    /// Dispatcher re-invoking the current executable with the `worker`
    /// subcommand.
    pub fn current_exe() -> Result<ProcessDispatcher> {
        Ok(ProcessDispatcher::new(std::env::current_exe()?, vec!["worker".to_owned()]))
    }
}

impl Dispatch for ProcessDispatcher {
    fn dispatch(&self, descriptor: BatchDescriptor) -> JoinHandle<Result<u64>> {
        let program = self.program.clone();
        let args = self.args.clone();
        tokio::spawn(async move {
            let batch = descriptor.batch_num;
            debug!(batch, index = %descriptor.dest_index, "spawning worker");
            let mut child = Command::new(&program)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let payload = serde_json::to_vec(&descriptor)?;
            {
                let mut stdin = child.stdin.take().expect("worker stdin is piped");
                stdin.write_all(&payload).await?;
                // closing stdin signals end-of-descriptor
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::BatchFailed {
                    batch,
                    message: stderr.trim().lines().last().unwrap_or("worker failed").to_owned(),
                });
            }
            let report: WorkerReport = serde_json::from_slice(&output.stdout)?;
            Ok(report.indexed)
        })
    }
}
