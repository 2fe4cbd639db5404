use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Category of a live job, the first half of the admission key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCategory {
    /// A batch in flight on a worker process.
    Indexer,
    /// A management operation: index creation, snapshotting, publishing.
    IndexManager,
}

impl JobCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Indexer => "indexer",
            JobCategory::IndexManager => "index-manager",
        }
    }
}

/// Live job table with bounded admission.
///
/// `acquire` suspends until fewer than `limit` jobs keyed
/// `(category, source)` are running, then registers the new job and returns
/// a permit that unregisters it on drop. The per-environment batch bound
/// (`category=indexer, source=<env>`) and the manager single-flight guard
/// (`category=index-manager, limit=1`) are both admission predicates over
/// this table.
#[derive(Debug, Default)]
pub struct JobPool {
    running: Mutex<HashMap<(JobCategory, String), usize>>,
    notify: Notify,
}

impl JobPool {
    pub fn new() -> Arc<JobPool> {
        Arc::new(JobPool::default())
    }

    pub async fn acquire(
        self: &Arc<Self>,
        category: JobCategory,
        source: &str,
        limit: usize,
    ) -> JobPermit {
        let key = (category, source.to_owned());
        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut running = self.running.lock().unwrap();
                let slot = running.entry(key.clone()).or_insert(0);
                if *slot < limit {
                    *slot += 1;
                    return JobPermit { pool: Arc::clone(self), key };
                }
            }
            notified.await;
        }
    }

    /// Number of running jobs for `(category, source)`.
    pub fn running(&self, category: JobCategory, source: &str) -> usize {
        let running = self.running.lock().unwrap();
        running.get(&(category, source.to_owned())).copied().unwrap_or(0)
    }

    fn release(&self, key: &(JobCategory, String)) {
        let mut running = self.running.lock().unwrap();
        if let Some(slot) = running.get_mut(key) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                running.remove(key);
            }
        }
        drop(running);
        self.notify.notify_waiters();
    }
}

/// RAII admission slot; dropping it frees the slot and wakes waiters.
pub struct JobPermit {
    pool: Arc<JobPool>,
    key: (JobCategory, String),
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}
