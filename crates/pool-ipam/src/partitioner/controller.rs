//! Controller loop driving the partitioner
//!
//! Each pool gets its own worker task fed through a coalescing trigger
//! channel, so pools reconcile concurrently while each pool's reconciliation
//! stays single-threaded. A failing pool retries with backoff without
//! holding up the others.

use super::backoff::Backoff;
use super::reconciler::PoolPartitioner;
use crate::config::ControllerConfig;
use crate::registry::{ClusterRegistry, RegistryEvent};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runs the partitioner against registry events
pub struct PartitionController {
    registry: Arc<dyn ClusterRegistry>,
    partitioner: Arc<PoolPartitioner>,
    config: ControllerConfig,
    workers: HashMap<String, PoolWorker>,
}

struct PoolWorker {
    trigger: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PartitionController {
    pub fn new(registry: Arc<dyn ClusterRegistry>, config: ControllerConfig) -> Self {
        let partitioner = Arc::new(PoolPartitioner::new(registry.clone(), config.policy()));
        Self {
            registry,
            partitioner,
            config,
            workers: HashMap::new(),
        }
    }

    pub fn partitioner(&self) -> Arc<PoolPartitioner> {
        self.partitioner.clone()
    }

    /// Run until the shutdown signal flips to `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.registry.subscribe();
        let mut resync = tokio::time::interval(self.config.resync_interval);
        info!(
            resync_interval = ?self.config.resync_interval,
            min_block_size = self.config.min_block_size,
            "Partition controller started"
        );

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    self.trigger_all().await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.route(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Registry events lagged, resyncing all pools");
                        self.trigger_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Registry event stream closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (pool, worker) in self.workers.drain() {
            debug!(pool = %pool, "Stopping pool worker");
            worker.handle.abort();
        }
        info!("Partition controller stopped");
        Ok(())
    }

    async fn route(&mut self, event: RegistryEvent) {
        match &event {
            // our own writes
            RegistryEvent::AssignmentUpserted(_) => {}
            RegistryEvent::NodeUpserted { .. } | RegistryEvent::NodeDeleted { .. } => {
                debug!(event = %event.description(), "Membership changed");
                self.trigger_all().await;
            }
            _ => {
                if let Some(pool) = event.pool() {
                    self.trigger(pool);
                }
            }
        }
    }

    /// Trigger every known pool, plus pools with workers still running
    async fn trigger_all(&mut self) {
        self.workers.retain(|_, w| !w.trigger.is_closed());
        match self.registry.list_pools().await {
            Ok(pools) => {
                for pool in pools {
                    self.trigger(&pool.name);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list pools"),
        }
        let running: Vec<String> = self.workers.keys().cloned().collect();
        for pool in running {
            self.trigger(&pool);
        }
    }

    fn trigger(&mut self, pool: &str) {
        let alive = self
            .workers
            .get(pool)
            .map_or(false, |w| !w.trigger.is_closed());
        if !alive {
            let worker = self.spawn_worker(pool);
            self.workers.insert(pool.to_string(), worker);
        }
        if let Some(worker) = self.workers.get(pool) {
            // a full channel already holds a pending trigger
            let _ = worker.trigger.try_send(());
        }
    }

    fn spawn_worker(&self, pool: &str) -> PoolWorker {
        let (trigger, rx) = mpsc::channel(1);
        let handle = tokio::spawn(pool_worker(
            pool.to_string(),
            self.partitioner.clone(),
            Backoff::new(self.config.backoff.clone()),
            rx,
        ));
        PoolWorker { trigger, handle }
    }
}

/// Reconcile one pool per trigger, retrying failures with backoff
///
/// Exits once the pool is gone and its records were removed.
async fn pool_worker(
    pool: String,
    partitioner: Arc<PoolPartitioner>,
    mut backoff: Backoff,
    mut triggers: mpsc::Receiver<()>,
) {
    debug!(pool = %pool, "Pool worker started");
    while triggers.recv().await.is_some() {
        loop {
            match partitioner.reconcile(&pool).await {
                Ok(outcome) => {
                    backoff.reset();
                    if outcome.pool_removed {
                        info!(pool = %pool, "Pool removed, worker exiting");
                        return;
                    }
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if e.is_retryable() {
                        warn!(pool = %pool, error = %e, retry_in = ?delay, "Reconcile failed");
                    } else {
                        error!(pool = %pool, error = %e, retry_in = ?delay, "Reconcile failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        more = triggers.recv() => {
                            if more.is_none() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
