//! In-memory store
//!
//! Survives engine restarts within one process (share the `Arc`), which is
//! what the recovery tests need. Failure and latency can be injected.

use super::{AllocationStore, PoolSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<BTreeMap<String, PoolSnapshot>>,
    fail_commits: AtomicBool,
    commit_delay_ms: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Delay every following commit
    pub fn set_commit_delay(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, pool: &str) -> Option<PoolSnapshot> {
        self.snapshots.read().get(pool).cloned()
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn load(&self) -> Result<Vec<PoolSnapshot>> {
        Ok(self.snapshots.read().values().cloned().collect())
    }

    async fn commit(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::PersistenceFailure("injected commit failure".to_string()));
        }
        self.snapshots
            .write()
            .insert(snapshot.pool.clone(), snapshot.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, pool: &str) -> Result<()> {
        self.snapshots.write().remove(pool);
        Ok(())
    }
}
