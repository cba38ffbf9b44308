//! Pool IPAM
//!
//! Exclusive, collision-free assignment of addresses from cluster-wide pools
//! to container network interfaces:
//! - Pool partitioner: splits each pool into disjoint per-node ranges and
//!   publishes them as assignment records
//! - Node allocation engine: hands out addresses from the node's ranges,
//!   crash-consistent and idempotent per container interface
//! - Interface adapter: maps container-network-interface invocations onto
//!   the engine
//!
//! The partitioner and the engines never call each other; they converge on
//! the records of a [`registry::ClusterRegistry`].

pub mod adapter;
pub mod allocator;
pub mod api;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod models;
pub mod partitioner;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod telemetry;

// Re-export core types
pub use adapter::{AdapterRequest, Command, CniError, CniResult, InterfaceAdapter, PoolRequest};
pub use api::{create_router, start_server, AppState};
pub use config::IpamConfig;
pub use engine::{
    AssignmentWatcher, EngineConfig, EngineHealth, GarbageCollector, LiveContainerSource,
    NodeEngine, ReleaseReporter,
};
pub use error::{Error, ErrorCode, Result};
pub use models::{
    AddrRange, AddressFamily, Allocation, AllocationKey, AssignmentRecord, AssignmentState,
    NodeInfo, NodeSelector, PodRef, Pool, PoolSpec, ReleaseAck,
};
pub use partitioner::{PartitionController, PartitionPolicy, PoolPartitioner, RemainderPolicy};
pub use protocol::{
    AllocateRequest, AllocateResponse, AllocationService, CheckRequest, ReleaseRequest,
};
pub use registry::{ClusterRegistry, InMemoryRegistry, RegistryEvent};
pub use store::{AllocationStore, FileStore, MemoryStore};
