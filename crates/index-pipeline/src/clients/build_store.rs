use std::path::PathBuf;

use async_trait::async_trait;
use indexhub_types::build::BuildDoc;
use indexhub_types::tasks::JobState;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{BuildStore, StateSection};
use crate::{Error, Result};

/// Build-record store over a directory: one pretty-printed
/// `<build_id>.json` file per build. Writes go through a temp file and a
/// rename so a crash can never leave a half-written record, and through a
/// store-wide lock so concurrent steps serialize.
pub struct FsBuildStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsBuildStore {
    pub fn new(root: impl Into<PathBuf>) -> FsBuildStore {
        FsBuildStore { root: root.into(), write_lock: Mutex::new(()) }
    }

    fn build_path(&self, build_id: &str) -> PathBuf {
        self.root.join(format!("{build_id}.json"))
    }

    async fn read_doc(&self, build_id: &str) -> Result<Option<Value>> {
        let path = self.build_path(build_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_doc(&self, build_id: &str, doc: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.build_path(build_id);
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tokio::fs::write(tmp.path(), &bytes).await?;
        tmp.persist(&path).map_err(|err| Error::Io(err.error))?;
        Ok(())
    }

    async fn build_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.root.is_dir() {
            return Ok(ids);
        }
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    ids.push(stem.to_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Walks `doc` down `segments`, materializing objects along the way.
pub(crate) fn slot_mut<'a>(doc: &'a mut Value, segments: &[&str]) -> &'a mut Value {
    let mut slot = doc;
    for segment in segments {
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        slot = slot
            .as_object_mut()
            .unwrap()
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    slot
}

pub(crate) fn slot<'a>(doc: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut slot = doc;
    for segment in segments {
        slot = slot.get(segment)?;
    }
    Some(slot)
}

#[async_trait]
impl BuildStore for FsBuildStore {
    async fn get_build(&self, build_id: &str) -> Result<Option<BuildDoc>> {
        match self.read_doc(build_id).await? {
            Some(doc) => Ok(Some(BuildDoc::try_from(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_build_for_index(&self, index: &str) -> Result<Option<BuildDoc>> {
        // Builds are usually named after their index, so try a direct hit
        // before scanning lifecycle records.
        if let Some(build) = self.get_build(index).await? {
            return Ok(Some(build));
        }
        for build_id in self.build_ids().await? {
            if let Some(doc) = self.read_doc(&build_id).await? {
                if slot(&doc, &["index", index]).is_some() {
                    return Ok(Some(BuildDoc::try_from(doc)?));
                }
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
        let doc = match self.read_doc(build_id).await? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        match slot(&doc, &[section.as_str(), key, step]) {
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
        let _guard = self.write_lock.lock().await;
        let mut doc = self
            .read_doc(build_id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_id.to_owned()))?;
        *slot_mut(&mut doc, &[section.as_str(), key, step]) = serde_json::to_value(state)?;
        self.write_doc(build_id, &doc).await
    }

    async fn write_snapshot_env(&self, build_id: &str, snapshot: &str, env: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self
            .read_doc(build_id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_id.to_owned()))?;
        *slot_mut(&mut doc, &["snapshot", snapshot, "env"]) = Value::String(env.to_owned());
        self.write_doc(build_id, &doc).await
    }

    async fn prune_transient(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut pruned = 0;
        for build_id in self.build_ids().await? {
            let Some(mut doc) = self.read_doc(&build_id).await? else { continue };
            let mut dirty = false;
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
                        dirty = true;
                        pruned += 1;
                    }
                }
            }
            if dirty {
                self.write_doc(&build_id, &doc).await?;
            }
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for FsBuildStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBuildStore").field("root", &self.root).finish()
    }
}
