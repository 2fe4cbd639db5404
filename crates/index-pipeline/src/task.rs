use std::sync::Arc;

use indexhub_types::merge::deep_merge;
use indexhub_types::tasks::IndexMode;
use serde_json::Value;
use tracing::{info, warn};

use crate::clients::{
    connect_store, BulkAction, DocumentStore, HttpSearchEngine, SearchEngine,
};
use crate::dispatch::{BatchDescriptor, WorkerReport};
use crate::Result;

/// Worker-side routine indexing one batch of ids, independent of the hub
/// control plane: it reopens its own clients from the descriptor, scans the
/// documents and pushes them with bulk writes.
///
/// Per-document rejections are logged and skipped; the count of documents
/// actually written is the batch result. Infrastructure failures (transport,
/// engine reject of a whole request) fail the batch.
pub struct IndexingTask {
    store: Arc<dyn DocumentStore>,
    engine: Arc<dyn SearchEngine>,
    descriptor: BatchDescriptor,
}

impl IndexingTask {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<dyn SearchEngine>,
        descriptor: BatchDescriptor,
    ) -> IndexingTask {
        IndexingTask { store, engine, descriptor }
    }

    /// Opens the bundled clients from the descriptor's connection arguments
    /// and runs the batch. This is the entry point of the `worker`
    /// subcommand.
    pub async fn run_from_descriptor(descriptor: BatchDescriptor) -> Result<WorkerReport> {
        let store = connect_store(&descriptor.source_conn)?;
        let engine = Arc::new(HttpSearchEngine::new(&descriptor.engine_args)?);
        let indexed = IndexingTask::new(store, engine, descriptor).run().await?;
        Ok(WorkerReport { indexed })
    }

    pub async fn run(&self) -> Result<u64> {
        let BatchDescriptor {
            source_db,
            source_collection,
            dest_index,
            ids,
            mode,
            batch_num,
            bulk_args,
            ..
        } = &self.descriptor;

        let docs =
            self.store.fetch(source_db, source_collection, ids).await?;
        info!(
            batch = *batch_num,
            docs = docs.len(),
            index = %dest_index,
            %mode,
            "indexing batch"
        );

        let mut indexed = 0;
        for chunk in docs.chunks(bulk_args.chunk_size.max(1)) {
            let actions = self.actions(dest_index, *mode, chunk).await?;
            let report = self.engine.bulk(dest_index, &actions).await?;
            for (id, error) in &report.errors {
                warn!(batch = *batch_num, id = %id, error = %error, "document rejected");
            }
            indexed += report.indexed;
        }
        Ok(indexed)
    }

    /// Turns a chunk of source documents into bulk actions. Every mode
    /// writes with create-or-overwrite; `merge` first reads the currently
    /// indexed documents and deep-merges the incoming fields over them.
    async fn actions(
        &self,
        dest_index: &str,
        mode: IndexMode,
        docs: &[Value],
    ) -> Result<Vec<BulkAction>> {
        let mut actions = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(id) = doc.get("_id").and_then(Value::as_str) else {
                warn!("skipping a document without `_id`");
                continue;
            };
            actions.push(BulkAction { id: id.to_owned(), doc: doc.clone() });
        }

        if mode == IndexMode::Merge {
            let ids: Vec<String> = actions.iter().map(|action| action.id.clone()).collect();
            let existing = self.engine.get_documents(dest_index, &ids).await?;
            for (action, current) in actions.iter_mut().zip(existing) {
                if let Some(current) = current {
                    let mut merged = current;
                    deep_merge(&mut merged, &action.doc);
                    action.doc = merged;
                }
            }
        }

        Ok(actions)
    }
}
