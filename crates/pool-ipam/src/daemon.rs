//! Runtime wiring for the controller and the node agent
//!
//! Both runtimes take the registry as an argument: the cluster API client
//! lives outside this crate. Shutdown is signalled through a `watch`
//! channel; the node agent also stops when the engine turns fatal.

use crate::api::{self, AppState};
use crate::config::IpamConfig;
use crate::engine::{
    AssignmentWatcher, EngineConfig, EngineHealth, GarbageCollector, LiveContainerSource,
    NodeEngine, RangeReleased, ReleaseReporter,
};
use crate::partitioner::PartitionController;
use crate::registry::ClusterRegistry;
use crate::store::{AllocationStore, FileStore};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long background tasks get to finish after shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the partition controller until shutdown
pub async fn run_controller(
    config: &IpamConfig,
    registry: Arc<dyn ClusterRegistry>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    config.validate()?;
    PartitionController::new(registry, config.controller.clone())
        .run(shutdown)
        .await
}

/// Node agent: engine plus watcher, reporter, collector and API
pub struct NodeAgent {
    config: IpamConfig,
    engine: Arc<NodeEngine>,
    registry: Arc<dyn ClusterRegistry>,
    live: Option<Arc<dyn LiveContainerSource>>,
    released: mpsc::UnboundedReceiver<RangeReleased>,
}

impl NodeAgent {
    /// Agent backed by the file store under the configured data directory
    pub async fn open(
        config: IpamConfig,
        registry: Arc<dyn ClusterRegistry>,
        live: Option<Arc<dyn LiveContainerSource>>,
    ) -> Result<Self> {
        let store = FileStore::open(&config.node.data_dir).await?;
        Self::with_store(config, registry, Arc::new(store), live)
    }

    pub fn with_store(
        config: IpamConfig,
        registry: Arc<dyn ClusterRegistry>,
        store: Arc<dyn AllocationStore>,
        live: Option<Arc<dyn LiveContainerSource>>,
    ) -> Result<Self> {
        config.validate()?;
        let node = config.node.resolve_node_name()?;
        let (engine, released) = NodeEngine::new(node, EngineConfig::from(&config.node), store);
        Ok(Self {
            config,
            engine: Arc::new(engine),
            registry,
            live,
            released,
        })
    }

    pub fn engine(&self) -> Arc<NodeEngine> {
        self.engine.clone()
    }

    /// Run until shutdown; fails with `PersistenceFatal` when durability is lost
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let node = &self.config.node;
        info!(node = %self.engine.node(), data_dir = %node.data_dir.display(), "Starting node agent");

        // tasks stop on this one, which also fires on engine failure
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let watcher = AssignmentWatcher::new(
            self.engine.clone(),
            self.registry.clone(),
            node.resync_interval,
            node.backoff.clone(),
        );
        tasks.push(tokio::spawn({
            let stop = stop_rx.clone();
            async move {
                if let Err(e) = watcher.run(stop).await {
                    error!(error = %e, "Assignment watcher failed");
                }
            }
        }));

        let reporter = ReleaseReporter::new(
            self.engine.node(),
            self.registry.clone(),
            node.backoff.clone(),
        );
        tasks.push(tokio::spawn(reporter.run(self.released, stop_rx.clone())));

        if let Some(live) = self.live {
            let collector = GarbageCollector::new(self.engine.clone(), live, node.gc_grace_period);
            tasks.push(tokio::spawn(collector.run(node.gc_interval, stop_rx.clone())));
        }

        let addr = node.api.socket_addr()?;
        let state = Arc::new(AppState::new(self.engine.clone()));
        tasks.push(tokio::spawn({
            let stop = stop_rx.clone();
            async move {
                if let Err(e) = api::start_server(state, addr, stop).await {
                    error!(error = %e, "API server failed");
                }
            }
        }));

        let outcome = wait_for_stop(&self.engine, shutdown).await;
        let _ = stop_tx.send(true);

        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Shutdown timeout reached, some tasks may not have completed");
            }
        }
        info!(node = %self.engine.node(), "Node agent stopped");
        outcome
    }
}

async fn wait_for_stop(engine: &NodeEngine, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut health = engine.subscribe_health();
    loop {
        if *health.borrow() == EngineHealth::Fatal {
            error!("Persistence failed beyond grace period, stopping node agent");
            return Err(Error::PersistenceFatal(
                "allocation store unavailable beyond grace period".to_string(),
            ));
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown signal received");
                    return Ok(());
                }
            }
            changed = health.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
