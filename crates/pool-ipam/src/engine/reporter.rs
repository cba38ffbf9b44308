//! Release reporter
//!
//! Turns drained-assignment signals from the engine into release
//! acknowledgements in the registry, off the request path.

use super::node_engine::RangeReleased;
use crate::models::ReleaseAck;
use crate::partitioner::{Backoff, BackoffConfig};
use crate::registry::ClusterRegistry;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct ReleaseReporter {
    node: String,
    registry: Arc<dyn ClusterRegistry>,
    backoff: BackoffConfig,
}

impl ReleaseReporter {
    pub fn new(
        node: impl Into<String>,
        registry: Arc<dyn ClusterRegistry>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            node: node.into(),
            registry,
            backoff,
        }
    }

    pub async fn run(
        self,
        mut released: mpsc::UnboundedReceiver<RangeReleased>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let signal = tokio::select! {
                signal = released.recv() => signal,
                _ = shutdown.changed() => None,
            };
            let Some(signal) = signal else { break };
            if !self.report(signal, &mut shutdown).await {
                break;
            }
        }
    }

    /// Write one acknowledgement, retrying until it lands; false on shutdown
    async fn report(&self, signal: RangeReleased, shutdown: &mut watch::Receiver<bool>) -> bool {
        let ack = ReleaseAck {
            pool: signal.pool,
            node: self.node.clone(),
            generation: signal.generation,
        };
        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            match self.registry.acknowledge_release(ack.clone()).await {
                Ok(()) => {
                    info!(pool = %ack.pool, generation = ack.generation, "Acknowledged release");
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(pool = %ack.pool, error = %e, retry_in = ?delay, "Failed to acknowledge release");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }
}
