//! Pool partitioner
//!
//! Splits each pool into disjoint per-node blocks and publishes them as
//! assignment records:
//! - Deterministic carving in node order, first-fit over free space
//! - Two-phase reclamation: Active → Draining → freed on acknowledgement
//! - Per-pool workers with exponential backoff on failure

mod backoff;
mod controller;
mod policy;
mod reconciler;

pub use backoff::{Backoff, BackoffConfig};
pub use controller::PartitionController;
pub use policy::{PartitionPolicy, RemainderPolicy};
pub use reconciler::{plan, PoolPartitioner, ReconcileOutcome, ReconcilePlan};
