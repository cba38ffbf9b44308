//! Block sizing for newly placed nodes

use crate::models::Pool;
use serde::{Deserialize, Serialize};

/// Where the addresses left over by an even split go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemainderPolicy {
    /// One extra address each to the first nodes in carve order
    #[default]
    Spread,
    /// The whole remainder to the first node in carve order
    FirstNode,
    /// Left unassigned, available to nodes joining later
    Unassigned,
}

/// How free pool space is split among nodes lacking an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPolicy {
    /// Smallest block handed to a node, unless the free space itself is smaller
    pub min_block_size: u64,
    pub remainder: RemainderPolicy,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            min_block_size: 8,
            remainder: RemainderPolicy::Spread,
        }
    }
}

impl PartitionPolicy {
    pub fn new(min_block_size: u64, remainder: RemainderPolicy) -> Self {
        Self {
            min_block_size: min_block_size.max(1),
            remainder,
        }
    }

    /// Block sizes for `count` new nodes, in carve order
    ///
    /// Sizes may sum to more than `free`; the carver then fails the trailing
    /// nodes, which are reported unplaced.
    pub fn block_sizes(&self, pool: &Pool, free: u128, count: usize) -> Vec<u128> {
        if count == 0 {
            return Vec::new();
        }
        if let Some(size) = pool.per_node_block_size {
            return vec![size as u128; count];
        }

        let min = (self.min_block_size.max(1) as u128).min(free.max(1));
        let base = free / count as u128;
        if base < min {
            return vec![min; count];
        }

        let mut sizes = vec![base; count];
        let remainder = free - base * count as u128;
        match self.remainder {
            RemainderPolicy::Spread => {
                for size in sizes.iter_mut().take(remainder as usize) {
                    *size += 1;
                }
            }
            RemainderPolicy::FirstNode => sizes[0] += remainder,
            RemainderPolicy::Unassigned => {}
        }
        sizes
    }
}
