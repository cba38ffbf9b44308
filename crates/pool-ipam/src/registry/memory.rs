//! In-process registry backed by maps and a broadcast channel

use super::{ClusterRegistry, RegistryEvent};
use crate::models::{AssignmentRecord, NodeInfo, Pool, PoolSpec, ReleaseAck};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default event channel capacity
const EVENT_CAPACITY: usize = 1024;

type RecordKey = (String, String);

#[derive(Debug, Default)]
struct RegistryState {
    pools: BTreeMap<String, Pool>,
    nodes: BTreeMap<String, NodeInfo>,
    assignments: BTreeMap<RecordKey, AssignmentRecord>,
    acks: BTreeMap<RecordKey, ReleaseAck>,
}

/// Registry kept in memory; admission validation happens in [`Self::apply_pool`]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    fail_writes: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            fail_writes: AtomicBool::new(false),
        }
    }

    fn publish(&self, event: RegistryEvent) {
        debug!(event = %event.description(), "Registry event");
        // no subscribers is a valid state
        let _ = self.events.send(event);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Registry("registry rejected write".to_string()));
        }
        Ok(())
    }

    /// Make assignment writes fail, for exercising retries
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Admit a pool definition; invalid definitions are rejected here
    pub fn apply_pool(&self, spec: &PoolSpec) -> Result<Pool> {
        let pool = spec.validate()?;
        {
            let mut state = self.state.write();
            if let Some(existing) = state.pools.get(&pool.name) {
                if existing == &pool {
                    return Ok(pool);
                }
            }
            state.pools.insert(pool.name.clone(), pool.clone());
        }
        info!(pool = %pool.name, span = %pool.span, "Admitted pool");
        self.publish(RegistryEvent::PoolUpserted {
            pool: pool.name.clone(),
        });
        Ok(pool)
    }

    /// Delete a pool definition; derived assignments are withdrawn by the partitioner
    pub fn delete_pool(&self, name: &str) -> bool {
        let removed = self.state.write().pools.remove(name).is_some();
        if removed {
            info!(pool = %name, "Deleted pool");
            self.publish(RegistryEvent::PoolDeleted {
                pool: name.to_string(),
            });
        }
        removed
    }

    /// Add a node or replace its labels
    pub fn upsert_node(&self, node: NodeInfo) {
        let name = node.name.clone();
        {
            let mut state = self.state.write();
            if state.nodes.get(&name) == Some(&node) {
                return;
            }
            state.nodes.insert(name.clone(), node);
        }
        self.publish(RegistryEvent::NodeUpserted { node: name });
    }

    /// Remove a node from the cluster
    pub fn remove_node(&self, name: &str) -> bool {
        let removed = self.state.write().nodes.remove(name).is_some();
        if removed {
            self.publish(RegistryEvent::NodeDeleted {
                node: name.to_string(),
            });
        }
        removed
    }

    /// One assignment record
    pub fn assignment(&self, pool: &str, node: &str) -> Option<AssignmentRecord> {
        self.state
            .read()
            .assignments
            .get(&(pool.to_string(), node.to_string()))
            .cloned()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterRegistry for InMemoryRegistry {
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.state.read().pools.values().cloned().collect())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Pool>> {
        Ok(self.state.read().pools.get(name).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.state.read().nodes.values().cloned().collect())
    }

    async fn list_assignments(&self, pool: &str) -> Result<Vec<AssignmentRecord>> {
        Ok(self
            .state
            .read()
            .assignments
            .values()
            .filter(|r| r.pool == pool)
            .cloned()
            .collect())
    }

    async fn node_assignments(&self, node: &str) -> Result<Vec<AssignmentRecord>> {
        Ok(self
            .state
            .read()
            .assignments
            .values()
            .filter(|r| r.node == node)
            .cloned()
            .collect())
    }

    async fn put_assignment(&self, record: AssignmentRecord) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let key = (record.pool.clone(), record.node.clone());
            if state.assignments.get(&key) == Some(&record) {
                return Ok(());
            }
            state.assignments.insert(key, record.clone());
        }
        self.publish(RegistryEvent::AssignmentUpserted(record));
        Ok(())
    }

    async fn delete_assignment(&self, pool: &str, node: &str) -> Result<()> {
        self.check_writable()?;
        let key = (pool.to_string(), node.to_string());
        let removed = {
            let mut state = self.state.write();
            state.acks.remove(&key);
            state.assignments.remove(&key).is_some()
        };
        if removed {
            self.publish(RegistryEvent::AssignmentDeleted {
                pool: pool.to_string(),
                node: node.to_string(),
            });
        }
        Ok(())
    }

    async fn acknowledge_release(&self, ack: ReleaseAck) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let key = (ack.pool.clone(), ack.node.clone());
            if state.acks.get(&key) == Some(&ack) {
                return Ok(());
            }
            state.acks.insert(key, ack.clone());
        }
        self.publish(RegistryEvent::ReleaseAcknowledged(ack));
        Ok(())
    }

    async fn release_acks(&self, pool: &str) -> Result<Vec<ReleaseAck>> {
        Ok(self
            .state
            .read()
            .acks
            .values()
            .filter(|a| a.pool == pool)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
