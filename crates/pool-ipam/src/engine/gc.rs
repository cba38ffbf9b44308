//! Garbage collection of allocations whose container is gone
//!
//! A container id missing from the live set starts a clock; only once it
//! has stayed missing for the whole grace period are its allocations
//! released, through the same path as an explicit release.

use super::node_engine::NodeEngine;
use crate::protocol::{AllocationService, ReleaseRequest};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source of container ids currently alive on this node
#[async_trait]
pub trait LiveContainerSource: Send + Sync {
    async fn live_containers(&self) -> Result<HashSet<String>>;
}

pub struct GarbageCollector {
    engine: Arc<NodeEngine>,
    source: Arc<dyn LiveContainerSource>,
    grace_period: Duration,
    missing_since: Mutex<HashMap<String, Instant>>,
}

impl GarbageCollector {
    pub fn new(
        engine: Arc<NodeEngine>,
        source: Arc<dyn LiveContainerSource>,
        grace_period: Duration,
    ) -> Self {
        Self {
            engine,
            source,
            grace_period,
            missing_since: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        warn!(error = %e, "Garbage collection round failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn collect(&self) -> Result<usize> {
        self.collect_at(Instant::now()).await
    }

    /// One round; returns the number of allocations released
    pub async fn collect_at(&self, now: Instant) -> Result<usize> {
        if !self.engine.is_ready() {
            return Ok(0);
        }
        let live = match self.source.live_containers().await {
            Ok(live) => live,
            Err(e) => {
                // an unknown live set confirms nothing gone
                warn!(error = %e, "Live container query failed, skipping round");
                return Ok(0);
            }
        };

        let allocations = self.engine.all_allocations().await;
        let mut expired = Vec::new();
        {
            let mut missing = self.missing_since.lock();
            let allocated: HashSet<&str> = allocations
                .iter()
                .map(|(_, a)| a.container_id.as_str())
                .collect();
            missing.retain(|cid, _| allocated.contains(cid.as_str()) && !live.contains(cid));

            for (pool, allocation) in &allocations {
                if live.contains(&allocation.container_id) {
                    continue;
                }
                let since = *missing
                    .entry(allocation.container_id.clone())
                    .or_insert(now);
                if now.duration_since(since) >= self.grace_period {
                    expired.push((pool.clone(), allocation.clone()));
                } else {
                    debug!(pool = %pool, container_id = %allocation.container_id, "Container missing, within grace period");
                }
            }
        }

        let mut released = 0;
        for (pool, allocation) in expired {
            let request = ReleaseRequest::new(&pool, &allocation.container_id, &allocation.if_name);
            match self.engine.release(request).await {
                Ok(()) => {
                    released += 1;
                    info!(
                        pool = %pool,
                        container_id = %allocation.container_id,
                        address = %allocation.address,
                        "Reclaimed allocation of vanished container"
                    );
                }
                Err(e) => warn!(pool = %pool, container_id = %allocation.container_id, error = %e, "Failed to reclaim allocation"),
            }
        }
        Ok(released)
    }
}
