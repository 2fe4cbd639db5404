use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use indexhub_types::config::StoreConnArgs;
use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::DocumentStore;
use crate::{Error, Result};

/// Opens a [`DocumentStore`] from its connection URI. The scheme selects the
/// client; `jsonl:<root>` is the bundled filesystem-backed store.
pub fn connect_store(args: &StoreConnArgs) -> Result<Arc<dyn DocumentStore>> {
    match args.uri.split_once(':') {
        Some(("jsonl", root)) => Ok(Arc::new(JsonlStore::new(root))),
        _ => Err(Error::Config(format!(
            "unsupported document store uri `{}` (expected a `jsonl:<root>` uri)",
            args.uri
        ))),
    }
}

/// Document store over a directory tree: one `<root>/<db>/<collection>.jsonl`
/// file per collection, one JSON document per line. Suited to snapshotted
/// build outputs, which are written once and scanned many times.
#[derive(Debug)]
pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    pub fn new(root: impl Into<PathBuf>) -> JsonlStore {
        JsonlStore { root: root.into() }
    }

    fn collection_path(&self, db: &str, collection: &str) -> PathBuf {
        self.root.join(db).join(format!("{collection}.jsonl"))
    }
}

fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

async fn read_lines(path: &Path) -> Result<tokio::io::Lines<BufReader<fs::File>>> {
    let file = fs::File::open(path).await?;
    Ok(BufReader::new(file).lines())
}

#[async_trait]
impl DocumentStore for JsonlStore {
    async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let mut collections = Vec::new();
        let db_dir = self.root.join(db);
        if !db_dir.is_dir() {
            return Ok(collections);
        }
        let mut entries = fs::read_dir(&db_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    collections.push(stem.to_owned());
                }
            }
        }
        collections.sort();
        Ok(collections)
    }

    async fn count(&self, db: &str, collection: &str) -> Result<u64> {
        let mut lines = read_lines(&self.collection_path(db, collection)).await?;
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn id_batches(
        &self,
        db: &str,
        collection: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<String>>> {
        let path = self.collection_path(db, collection);
        let stream = async_stream(path, batch_size);
        stream.boxed()
    }

    async fn fetch(&self, db: &str, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        let wanted: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut lines = read_lines(&self.collection_path(db, collection)).await?;
        let mut docs = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(&line)?;
            if doc_id(&doc).is_some_and(|id| wanted.contains(id)) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

/// Streams `_id` chunks off a JSONL file without loading it whole.
fn async_stream(
    path: PathBuf,
    batch_size: usize,
) -> impl futures::Stream<Item = Result<Vec<String>>> {
    futures::stream::unfold(IdFeeder { path, batch_size, lines: None, done: false }, |feeder| {
        Box::pin(async move { feeder.next_chunk().await })
    })
}

struct IdFeeder {
    path: PathBuf,
    batch_size: usize,
    lines: Option<tokio::io::Lines<BufReader<fs::File>>>,
    done: bool,
}

impl IdFeeder {
    async fn next_chunk(mut self) -> Option<(Result<Vec<String>>, IdFeeder)> {
        if self.done {
            return None;
        }
        if self.lines.is_none() {
            match read_lines(&self.path).await {
                Ok(lines) => self.lines = Some(lines),
                Err(err) => {
                    self.done = true;
                    return Some((Err(err), self));
                }
            }
        }
        let lines = self.lines.as_mut().unwrap();
        let mut chunk = Vec::with_capacity(self.batch_size);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(doc) => {
                            if let Some(id) = doc_id(&doc) {
                                chunk.push(id.to_owned());
                            }
                        }
                        Err(err) => {
                            self.done = true;
                            return Some((Err(err.into()), self));
                        }
                    }
                    if chunk.len() == self.batch_size {
                        return Some((Ok(chunk), self));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    if chunk.is_empty() {
                        return None;
                    }
                    return Some((Ok(chunk), self));
                }
                Err(err) => {
                    self.done = true;
                    return Some((Err(err.into()), self));
                }
            }
        }
    }
}
