//! Assignment watcher
//!
//! Drives startup recovery with the node's current records, then follows
//! registry events for this node, with a periodic full resync to repair
//! anything missed.

use super::node_engine::{EngineHealth, NodeEngine};
use crate::partitioner::{Backoff, BackoffConfig};
use crate::registry::{ClusterRegistry, RegistryEvent};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct AssignmentWatcher {
    engine: Arc<NodeEngine>,
    registry: Arc<dyn ClusterRegistry>,
    resync_interval: Duration,
    backoff: BackoffConfig,
}

impl AssignmentWatcher {
    pub fn new(
        engine: Arc<NodeEngine>,
        registry: Arc<dyn ClusterRegistry>,
        resync_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            resync_interval,
            backoff,
        }
    }

    /// Recover the engine, then follow the registry until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.registry.subscribe();

        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            match self.recover().await {
                Ok(()) => break,
                Err(e) => {
                    if self.engine.health() == EngineHealth::Fatal {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Startup recovery failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        }

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.tick().await;
        loop {
            tokio::select! {
                _ = resync.tick() => self.resync().await,
                event = events.recv() => match event {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Registry events lagged, resyncing assignments");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(node = %self.engine.node(), "Assignment watcher stopped");
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        let records = self.registry.node_assignments(self.engine.node()).await?;
        self.engine.recover(&records).await
    }

    async fn resync(&self) {
        let result = match self.registry.node_assignments(self.engine.node()).await {
            Ok(records) => self.engine.sync_assignments(&records).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Assignment resync failed");
        }
    }

    async fn handle(&self, event: RegistryEvent) {
        if event.assignment_node() != Some(self.engine.node()) {
            return;
        }
        debug!(event = %event.description(), "Assignment event");
        let result = match &event {
            RegistryEvent::AssignmentUpserted(record) => self.engine.apply_assignment(record).await,
            RegistryEvent::AssignmentDeleted { pool, .. } => self.engine.remove_assignment(pool).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            // the next resync applies the record again
            warn!(event = %event.description(), error = %e, "Failed to apply assignment event");
        }
    }
}
