//! Declarative cluster registry
//!
//! The partitioner and the node agents never call each other: the partitioner
//! publishes assignment records here, each node converges on its own records
//! and answers with release acknowledgements. [`ClusterRegistry`] is the typed
//! contract of that shared state; the cluster API behind it is external.

mod events;
mod memory;

pub use events::RegistryEvent;
pub use memory::InMemoryRegistry;

use crate::models::{AssignmentRecord, NodeInfo, Pool, ReleaseAck};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Typed view of pools, nodes, assignment records and acknowledgements
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// All admitted pools
    async fn list_pools(&self) -> Result<Vec<Pool>>;

    /// One pool by name
    async fn get_pool(&self, name: &str) -> Result<Option<Pool>>;

    /// All nodes currently in the cluster
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Assignment records of a pool
    async fn list_assignments(&self, pool: &str) -> Result<Vec<AssignmentRecord>>;

    /// Assignment records owned by a node
    async fn node_assignments(&self, node: &str) -> Result<Vec<AssignmentRecord>>;

    /// Create or replace an assignment record
    async fn put_assignment(&self, record: AssignmentRecord) -> Result<()>;

    /// Delete an assignment record (and its acknowledgement)
    async fn delete_assignment(&self, pool: &str, node: &str) -> Result<()>;

    /// Record that a draining assignment holds no live allocation
    async fn acknowledge_release(&self, ack: ReleaseAck) -> Result<()>;

    /// Release acknowledgements of a pool
    async fn release_acks(&self, pool: &str) -> Result<Vec<ReleaseAck>>;

    /// Subscribe to change events
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
