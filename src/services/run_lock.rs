use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-handler mutual exclusion. A handler whose previous run is still in
/// progress is skipped rather than queued.
#[derive(Default)]
pub struct RunLocks {
    locks: DashMap<&'static str, Arc<Semaphore>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `name`, or `None` if a run holds it. The lock is
    /// released when the permit drops.
    pub fn try_acquire(&self, name: &'static str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self
            .locks
            .entry(name)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        semaphore.try_acquire_owned().ok()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|s| s.available_permits() == 0)
            .unwrap_or(false)
    }
}
