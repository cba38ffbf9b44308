//! Address and block allocation
//!
//! Provides:
//! - Block carving of a pool's span into per-node ranges (partitioner side)
//! - Lowest-free address allocation within a node's ranges (engine side)

mod block_carver;
mod range_allocator;

pub use block_carver::BlockCarver;
pub use range_allocator::{merge_ranges, AddressAllocator, RangeAllocator};
