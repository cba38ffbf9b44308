//! Node allocation engine and its background tasks

mod gc;
mod node_engine;
mod pool_state;
mod reporter;
mod watcher;

pub use gc::{GarbageCollector, LiveContainerSource};
pub use node_engine::{EngineConfig, EngineHealth, NodeEngine, RangeReleased};
pub use pool_state::{PoolStatus, RangeStatus};
pub use reporter::ReleaseReporter;
pub use watcher::AssignmentWatcher;
