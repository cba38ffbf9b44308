//! Data models for pools, assignments and allocations

mod allocation;
mod assignment;
mod pool;
mod range;
mod selector;

pub use allocation::{Allocation, AllocationKey, PodRef};
pub use assignment::{AssignmentRecord, AssignmentState, PoolMeta, RangeLifecycle, ReleaseAck};
pub use pool::{Pool, PoolSpec, RangeSpec};
pub use range::{addr_to_u128, total_len, u128_to_addr, AddrRange, AddressFamily};
pub use selector::{NodeInfo, NodeSelector, SelectorOperator, SelectorRequirement};
