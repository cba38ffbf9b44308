//! Per-node range assignments and their lifecycle

use super::range::{total_len, AddrRange};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Published state of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    /// Node serves new allocations from the ranges
    Active,
    /// Node left the selector: releases only, no new allocations
    Draining,
}

/// Node-local lifecycle of an owned range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeLifecycle {
    Active,
    Draining,
    /// No live allocation remains; the range is reclaimable
    Released,
}

/// Pool metadata the node engine needs to answer allocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMeta {
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub exclusions: Vec<AddrRange>,
    #[serde(default)]
    pub routes: Vec<IpNet>,
}

/// One (pool, node) assignment record, written by the partitioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub pool: String,
    pub node: String,
    /// Ordered, pairwise disjoint sub-ranges of the pool
    pub ranges: Vec<AddrRange>,
    pub state: AssignmentState,
    /// Bumped on every change made by the partitioner
    pub generation: u64,
    pub pool_meta: PoolMeta,
    pub updated_at: DateTime<Utc>,
}

impl AssignmentRecord {
    /// New active assignment
    pub fn new(
        pool: impl Into<String>,
        node: impl Into<String>,
        mut ranges: Vec<AddrRange>,
        pool_meta: PoolMeta,
    ) -> Self {
        ranges.sort();
        Self {
            pool: pool.into(),
            node: node.into(),
            ranges,
            state: AssignmentState::Active,
            generation: 1,
            pool_meta,
            updated_at: Utc::now(),
        }
    }

    /// Copy with a new state and a bumped generation
    pub fn transitioned(&self, state: AssignmentState) -> Self {
        Self {
            state,
            generation: self.generation + 1,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Number of addresses across all ranges
    pub fn size(&self) -> u128 {
        total_len(&self.ranges)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    pub fn overlaps(&self, other: &AssignmentRecord) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
    }
}

/// Node acknowledgement that a draining assignment holds no live allocations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseAck {
    pub pool: String,
    pub node: String,
    /// Generation of the draining record being acknowledged
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PoolMeta {
        PoolMeta {
            subnet: "10.0.0.0/24".parse().unwrap(),
            gateway: None,
            exclusions: vec![],
            routes: vec![],
        }
    }

    #[test]
    fn test_ranges_sorted_on_creation() {
        let record = AssignmentRecord::new(
            "p1",
            "n1",
            vec![
                "10.0.0.20-10.0.0.29".parse().unwrap(),
                "10.0.0.1-10.0.0.9".parse().unwrap(),
            ],
            meta(),
        );
        assert_eq!(record.ranges[0].start(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(record.size(), 19);
    }

    #[test]
    fn test_transition_bumps_generation() {
        let record = AssignmentRecord::new("p1", "n1", vec!["10.0.0.1-10.0.0.9".parse().unwrap()], meta());
        let draining = record.transitioned(AssignmentState::Draining);
        assert_eq!(draining.generation, record.generation + 1);
        assert_eq!(draining.state, AssignmentState::Draining);
        assert_eq!(draining.ranges, record.ranges);
    }

    #[test]
    fn test_record_overlap() {
        let a = AssignmentRecord::new("p1", "n1", vec!["10.0.0.1-10.0.0.9".parse().unwrap()], meta());
        let b = AssignmentRecord::new("p1", "n2", vec!["10.0.0.9-10.0.0.19".parse().unwrap()], meta());
        let c = AssignmentRecord::new("p1", "n3", vec!["10.0.0.10-10.0.0.19".parse().unwrap()], meta());
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
