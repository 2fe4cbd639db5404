use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Progress counters of one `index` step: how many documents exist, how many
/// have been handed to workers, and how many came back indexed.
///
/// The invariant `0 <= finished <= scheduled <= total` holds at every point;
/// `draw` emits successive batch numbers `1..=ceil(total / batch_size)` and
/// advances `scheduled` by the size of the batch it just emitted.
#[derive(Debug)]
pub struct Schedule {
    total: u64,
    batch_size: u64,
    scheduled: AtomicU64,
    batches: AtomicU64,
    finished: AtomicU64,
}

impl Schedule {
    pub fn new(total: u64, batch_size: u64) -> Schedule {
        assert!(batch_size > 0, "batch_size must be positive");
        Schedule {
            total,
            batch_size,
            scheduled: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        }
    }

    /// Reserves the next batch and returns its number, or `None` once the
    /// whole total has been scheduled.
    pub fn draw(&self) -> Option<u64> {
        let mut scheduled = self.scheduled.load(Ordering::Relaxed);
        loop {
            if scheduled >= self.total {
                return None;
            }
            let next = (scheduled + self.batch_size).min(self.total);
            match self.scheduled.compare_exchange_weak(
                scheduled,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.batches.fetch_add(1, Ordering::Relaxed) + 1),
                Err(current) => scheduled = current,
            }
        }
    }

    /// Credits `count` indexed documents back to the schedule.
    pub fn record_finished(&self, count: u64) {
        self.finished.fetch_add(count, Ordering::Relaxed);
        debug_assert!(self.finished() <= self.scheduled());
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        self.finished() == self.total
    }

    /// Short progress tag used in job descriptions, e.g. `mynews #2/3`.
    pub fn tag(&self, name: &str) -> String {
        let planned = self.total.div_ceil(self.batch_size);
        format!("{name} #{}/{planned}", self.batches())
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let percent = |part: u64| {
            if self.total == 0 {
                100.0
            } else {
                part as f64 / self.total as f64 * 100.0
            }
        };
        write!(
            f,
            "scheduled {}/{} ({:.1}%), indexed {} ({:.1}%)",
            self.scheduled(),
            self.total,
            percent(self.scheduled()),
            self.finished(),
            percent(self.finished()),
        )
    }
}
