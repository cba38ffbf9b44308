//! Durable on-node allocation store
//!
//! One snapshot per pool holds every live allocation plus the last-known
//! assignment boundaries. Snapshots are read once at startup and replaced as
//! a whole on every mutation, so a commit is either fully visible or not at
//! all.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::models::{AddrRange, Allocation, AllocationKey, AssignmentState, PoolMeta};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persisted state of one pool on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Format version for migration
    pub version: u32,
    pub pool: String,
    /// Last-known assignment boundaries
    #[serde(default)]
    pub ranges: Vec<AddrRange>,
    /// Last-known assignment state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AssignmentState>,
    /// Generation of the last applied assignment record
    #[serde(default)]
    pub generation: u64,
    /// Pool metadata of the last applied assignment record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PoolMeta>,
    /// Live allocations, sorted by key
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

impl PoolSnapshot {
    /// Current snapshot format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            pool: pool.into(),
            ranges: Vec::new(),
            state: None,
            generation: 0,
            meta: None,
            allocations: Vec::new(),
        }
    }

    pub fn find(&self, key: &AllocationKey) -> Option<&Allocation> {
        self.allocations
            .binary_search_by(|a| {
                (a.container_id.as_str(), a.if_name.as_str())
                    .cmp(&(key.container_id.as_str(), key.if_name.as_str()))
            })
            .ok()
            .map(|i| &self.allocations[i])
    }

    /// Copy with one more allocation, kept in key order
    pub fn with_allocation(&self, allocation: Allocation) -> Self {
        let mut next = self.clone();
        next.allocations.retain(|a| a.key() != allocation.key());
        next.allocations.push(allocation);
        next.allocations.sort_by_key(|a| a.key());
        next
    }

    /// Copy without the allocation for a key
    pub fn without_allocation(&self, key: &AllocationKey) -> Self {
        let mut next = self.clone();
        next.allocations.retain(|a| &a.key() != key);
        next
    }
}

/// Durable allocation storage
///
/// `commit` must only return `Ok` once the snapshot is durable; a crash at any
/// point leaves either the previous or the new snapshot, never a mix.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Load every persisted pool snapshot
    async fn load(&self) -> Result<Vec<PoolSnapshot>>;

    /// Atomically replace the snapshot of a pool
    async fn commit(&self, snapshot: &PoolSnapshot) -> Result<()>;

    /// Remove the snapshot of a pool
    async fn remove(&self, pool: &str) -> Result<()>;
}
