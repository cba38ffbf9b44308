//! Node allocation engine
//!
//! Serves allocate/release/check for every pool assigned to this node.
//! Mutations of one pool are serialized under that pool's mutex; the durable
//! commit happens inside the same scope and before the in-memory state
//! changes, so success is never reported for something that is not durable.

use super::pool_state::{PoolState, PoolStatus};
use crate::config::NodeConfig;
use crate::models::{Allocation, AllocationKey, AssignmentRecord};
use crate::protocol::{
    AllocateRequest, AllocateResponse, AllocationService, CheckRequest, ReleaseRequest,
};
use crate::store::{AllocationStore, PoolSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Durability settings of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one durable-store write
    pub store_write_timeout: Duration,
    /// How long commits may keep failing before the engine turns fatal
    pub persistence_failure_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_write_timeout: Duration::from_secs(5),
            persistence_failure_grace: Duration::from_secs(30),
        }
    }
}

impl From<&NodeConfig> for EngineConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            store_write_timeout: config.store_write_timeout,
            persistence_failure_grace: config.persistence_failure_grace,
        }
    }
}

/// Engine health as seen by the node agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineHealth {
    /// Startup recovery has not completed
    Recovering,
    Ready,
    /// Persistence failed beyond the grace period; the process must exit
    Fatal,
}

/// Signal that a draining assignment holds no live allocation anymore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReleased {
    pub pool: String,
    pub generation: u64,
}

/// Tracks sustained persistence failure
#[derive(Debug, Default)]
struct Durability {
    failing_since: Option<Instant>,
}

pub struct NodeEngine {
    node: String,
    config: EngineConfig,
    store: Arc<dyn AllocationStore>,
    pools: DashMap<String, Arc<Mutex<PoolState>>>,
    ready: AtomicBool,
    durability: SyncMutex<Durability>,
    health: watch::Sender<EngineHealth>,
    released: mpsc::UnboundedSender<RangeReleased>,
}

impl NodeEngine {
    /// Create an engine; it serves nothing until [`Self::recover`] completes
    pub fn new(
        node: impl Into<String>,
        config: EngineConfig,
        store: Arc<dyn AllocationStore>,
    ) -> (Self, mpsc::UnboundedReceiver<RangeReleased>) {
        let (health, _) = watch::channel(EngineHealth::Recovering);
        let (released, released_rx) = mpsc::unbounded_channel();
        let engine = Self {
            node: node.into(),
            config,
            store,
            pools: DashMap::new(),
            ready: AtomicBool::new(false),
            durability: SyncMutex::new(Durability::default()),
            health,
            released,
        };
        (engine, released_rx)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> EngineHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }

    /// Reload the store and reconcile it against this node's assignment records
    ///
    /// Pools without a record keep their allocations, flagged orphaned.
    pub async fn recover(&self, records: &[AssignmentRecord]) -> Result<()> {
        let snapshots = self.store.load().await?;
        let mut allocations = 0;
        for snapshot in snapshots {
            allocations += snapshot.allocations.len();
            let state = PoolState::from_snapshot(snapshot);
            self.pools
                .insert(state.name().to_string(), Arc::new(Mutex::new(state)));
        }

        self.sync_assignments(records).await?;

        self.ready.store(true, Ordering::SeqCst);
        self.health.send_replace(EngineHealth::Ready);
        info!(
            node = %self.node,
            pools = self.pools.len(),
            allocations,
            "Allocation engine recovered"
        );
        Ok(())
    }

    /// Converge on the complete set of this node's records
    pub async fn sync_assignments(&self, records: &[AssignmentRecord]) -> Result<()> {
        let mut assigned = BTreeSet::new();
        for record in records.iter().filter(|r| r.node == self.node) {
            assigned.insert(record.pool.clone());
            self.apply_assignment(record).await?;
        }

        let withdrawn: Vec<String> = self
            .pools
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|pool| !assigned.contains(pool))
            .collect();
        for pool in withdrawn {
            self.remove_assignment(&pool).await?;
        }
        Ok(())
    }

    /// Apply a published assignment record of this node
    pub async fn apply_assignment(&self, record: &AssignmentRecord) -> Result<()> {
        if record.node != self.node {
            debug!(pool = %record.pool, node = %record.node, "Ignoring record of another node");
            return Ok(());
        }

        let mut state = self.lock_pool_or_insert(&record.pool).await;
        if !state.matches_record(record) {
            let next = state.stage_assignment(record);
            self.commit(&next).await?;
            state.apply_assignment(next);
            info!(
                pool = %record.pool,
                state = ?record.state,
                generation = record.generation,
                ranges = ?record.ranges,
                "Applied assignment"
            );
        }
        self.report_drained(&mut state);
        Ok(())
    }

    /// The pool's record was deleted: withdraw its ranges
    pub async fn remove_assignment(&self, pool_name: &str) -> Result<()> {
        let Some(mut state) = self.lock_pool(pool_name).await else {
            return Ok(());
        };

        if state.allocations().is_empty() {
            self.store.remove(pool_name).await?;
            // requests already queued on this state must not allocate from it
            state.retire();
            self.pools.remove(pool_name);
            info!(pool = %pool_name, "Assignment withdrawn, pool state removed");
            return Ok(());
        }

        if state.snapshot().state.is_some() || !state.snapshot().ranges.is_empty() {
            let next = state.stage_withdrawal();
            self.commit(&next).await?;
            state.apply_assignment(next);
            warn!(
                pool = %pool_name,
                allocations = state.allocations().len(),
                "Assignment withdrawn while allocations remain"
            );
        }
        Ok(())
    }

    /// Status of every pool on this node
    pub async fn pool_statuses(&self) -> Vec<PoolStatus> {
        let pools: Vec<Arc<Mutex<PoolState>>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        let mut statuses = Vec::with_capacity(pools.len());
        for pool in pools {
            let state = pool.lock().await;
            if !state.is_retired() {
                statuses.push(state.status());
            }
        }
        statuses.sort_by(|a, b| a.pool.cmp(&b.pool));
        statuses
    }

    /// Keys of the allocations of a pool flagged orphaned
    pub async fn orphans(&self, pool_name: &str) -> Vec<AllocationKey> {
        match self.lock_pool(pool_name).await {
            Some(state) => state.orphans().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Live allocations of one pool
    pub async fn allocations(&self, pool_name: &str) -> Result<Vec<Allocation>> {
        let state = self
            .lock_pool(pool_name)
            .await
            .ok_or_else(|| Error::PoolNotFound(pool_name.to_string()))?;
        Ok(state.allocations().to_vec())
    }

    /// Live allocations of every pool, for garbage collection
    pub async fn all_allocations(&self) -> Vec<(String, Allocation)> {
        let pools: Vec<Arc<Mutex<PoolState>>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        let mut all = Vec::new();
        for pool in pools {
            let state = pool.lock().await;
            let name = state.name().to_string();
            all.extend(state.allocations().iter().map(|a| (name.clone(), a.clone())));
        }
        all
    }

    fn pool(&self, name: &str) -> Option<Arc<Mutex<PoolState>>> {
        self.pools.get(name).map(|entry| entry.value().clone())
    }

    fn pool_or_insert(&self, name: &str) -> Arc<Mutex<PoolState>> {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PoolState::new(name))))
            .value()
            .clone()
    }

    /// Lock a pool, looking it up again when it was retired while waiting
    async fn lock_pool(&self, name: &str) -> Option<OwnedMutexGuard<PoolState>> {
        loop {
            let state = self.pool(name)?.lock_owned().await;
            if !state.is_retired() {
                return Some(state);
            }
        }
    }

    async fn lock_pool_or_insert(&self, name: &str) -> OwnedMutexGuard<PoolState> {
        loop {
            let state = self.pool_or_insert(name).lock_owned().await;
            if !state.is_retired() {
                return state;
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.health() == EngineHealth::Fatal {
            return Err(Error::PersistenceFatal(
                "engine stopped after sustained persistence failure".to_string(),
            ));
        }
        if !self.is_ready() {
            return Err(Error::NotReady("startup recovery in progress".to_string()));
        }
        Ok(())
    }

    fn report_drained(&self, state: &mut PoolState) {
        if let Some(generation) = state.take_drained() {
            info!(pool = %state.name(), generation, "Draining assignment fully released");
            // the receiver only goes away at shutdown
            let _ = self.released.send(RangeReleased {
                pool: state.name().to_string(),
                generation,
            });
        }
    }

    /// Durable commit with a bounded wait and grace-period tracking
    async fn commit(&self, snapshot: &PoolSnapshot) -> Result<()> {
        if self.health() == EngineHealth::Fatal {
            return Err(Error::PersistenceFatal(
                "engine stopped after sustained persistence failure".to_string(),
            ));
        }

        let timeout = self.config.store_write_timeout;
        let result = match tokio::time::timeout(timeout, self.store.commit(snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(Error::PersistenceTimeout(timeout)),
        };

        match result {
            Ok(()) => {
                let mut durability = self.durability.lock();
                if durability.failing_since.take().is_some() {
                    info!("Persistence recovered");
                }
                Ok(())
            }
            Err(e) => {
                let now = Instant::now();
                let since = *self.durability.lock().failing_since.get_or_insert(now);
                let failing_for = now.duration_since(since);
                // the failure opening the window is never fatal
                if failing_for > Duration::ZERO
                    && failing_for >= self.config.persistence_failure_grace
                {
                    error!(
                        pool = %snapshot.pool,
                        error = %e,
                        failing_for = ?failing_for,
                        "Persistence failing beyond grace period"
                    );
                    self.health.send_replace(EngineHealth::Fatal);
                    return Err(Error::PersistenceFatal(e.to_string()));
                }
                warn!(pool = %snapshot.pool, error = %e, "Durable write failed, operation aborted");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl AllocationService for NodeEngine {
    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        self.ensure_ready()?;
        let mut state = self.lock_pool(&request.pool).await.ok_or_else(|| {
            Error::NotReady(format!("no assignment received for pool {}", request.pool))
        })?;

        let key = request.key();
        if let Some(existing) = state.find(&key) {
            debug!(pool = %request.pool, allocation = %key, address = %existing.address, "Replayed allocation");
            return state.response(existing);
        }

        let address = state.choose_address(request.requested_address)?;
        let allocation = Allocation::new(&key, address, request.pod.clone());
        let next = state.snapshot().with_allocation(allocation.clone());
        self.commit(&next).await?;
        state.apply_allocation(next, &allocation)?;

        info!(pool = %request.pool, allocation = %key, address = %address, "Allocated address");
        state.response(&allocation)
    }

    async fn release(&self, request: ReleaseRequest) -> Result<()> {
        self.ensure_ready()?;
        let Some(mut state) = self.lock_pool(&request.pool).await else {
            return Ok(());
        };

        let key = request.key();
        let Some(allocation) = state.find(&key).cloned() else {
            debug!(pool = %request.pool, allocation = %key, "Release of absent allocation");
            return Ok(());
        };

        let next = state.snapshot().without_allocation(&key);
        self.commit(&next).await?;
        state.apply_release(next, &allocation);
        info!(pool = %request.pool, allocation = %key, address = %allocation.address, "Released address");

        self.report_drained(&mut state);
        Ok(())
    }

    async fn check(&self, request: CheckRequest) -> Result<()> {
        self.ensure_ready()?;
        let not_found = || Error::NotFound {
            pool: request.pool.clone(),
            container_id: request.container_id.clone(),
            if_name: request.if_name.clone(),
        };
        let state = self.lock_pool(&request.pool).await.ok_or_else(not_found)?;
        let allocation = state.find(&request.key()).ok_or_else(not_found)?;
        if allocation.address != request.address {
            return Err(Error::InconsistentState {
                recorded: allocation.address,
                reported: request.address,
            });
        }
        Ok(())
    }
}
