//! Per-pool state of the node engine
//!
//! Everything derived here (allocator, range lifecycles, orphans) is a pure
//! function of the last committed [`PoolSnapshot`]. Mutations are staged as
//! a new snapshot, committed by the engine, and only then applied.

use crate::allocator::{AddressAllocator, RangeAllocator};
use crate::models::{
    AddrRange, AddressFamily, Allocation, AllocationKey, AssignmentRecord, AssignmentState,
    PoolMeta, RangeLifecycle,
};
use crate::protocol::AllocateResponse;
use crate::store::PoolSnapshot;
use crate::{Error, Result};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{info, warn};

/// An owned range and its node-local lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeStatus {
    pub range: AddrRange,
    pub lifecycle: RangeLifecycle,
    /// Live allocations inside the range
    pub allocated: usize,
}

/// Read-only view of a pool on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool: String,
    pub state: Option<AssignmentState>,
    pub generation: u64,
    pub subnet: Option<IpNet>,
    pub ranges: Vec<RangeStatus>,
    pub allocated: usize,
    /// Free addresses in active ranges, saturating
    pub available: u64,
    pub orphans: Vec<AllocationKey>,
}

pub(crate) struct PoolState {
    name: String,
    committed: PoolSnapshot,
    allocator: RangeAllocator,
    ranges: Vec<RangeStatus>,
    orphans: BTreeSet<AllocationKey>,
    /// Generation whose drained state was already reported
    reported_generation: Option<u64>,
    /// Dropped from the engine; holders of a stale handle must look it up again
    retired: bool,
}

impl PoolState {
    pub fn new(name: &str) -> Self {
        Self::from_snapshot(PoolSnapshot::new(name))
    }

    /// Rebuild all derived state from a snapshot
    pub fn from_snapshot(mut snapshot: PoolSnapshot) -> Self {
        snapshot.allocations.sort_by_key(|a| a.key());
        let name = snapshot.pool.clone();
        let allocator = build_allocator(&snapshot);
        let mut state = Self {
            name,
            committed: snapshot,
            allocator,
            ranges: Vec::new(),
            orphans: BTreeSet::new(),
            reported_generation: None,
            retired: false,
        };
        state.refresh();
        state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> &PoolSnapshot {
        &self.committed
    }

    pub fn find(&self, key: &AllocationKey) -> Option<&Allocation> {
        self.committed.find(key)
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.committed.allocations
    }

    /// Mark the state as no longer served; nothing is allocated from it again
    pub fn retire(&mut self) {
        self.retired = true;
        self.allocator.set_active(&[]);
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Assignment already reflected in the committed snapshot
    pub fn matches_record(&self, record: &AssignmentRecord) -> bool {
        self.committed.generation == record.generation
            && self.committed.state == Some(record.state)
            && self.committed.ranges == record.ranges
            && self.committed.meta.as_ref() == Some(&record.pool_meta)
    }

    /// Snapshot carrying a new assignment
    pub fn stage_assignment(&self, record: &AssignmentRecord) -> PoolSnapshot {
        let mut next = self.committed.clone();
        next.ranges = record.ranges.clone();
        next.state = Some(record.state);
        next.generation = record.generation;
        next.meta = Some(record.pool_meta.clone());
        next
    }

    /// Snapshot with the assignment withdrawn; allocations are kept
    pub fn stage_withdrawal(&self) -> PoolSnapshot {
        let mut next = self.committed.clone();
        next.ranges.clear();
        next.state = None;
        next
    }

    /// Pick the address for a new allocation without mutating anything
    pub fn choose_address(&self, requested: Option<IpAddr>) -> Result<IpAddr> {
        if !self.allocator.has_active() {
            return Err(Error::NotReady(format!(
                "pool {} has no active range on this node",
                self.name
            )));
        }

        match requested {
            Some(ip) => {
                if !self.allocator.in_active(ip) || self.allocator.is_excluded(ip) {
                    return Err(Error::AddressOutOfRange {
                        address: ip,
                        pool: self.name.clone(),
                    });
                }
                if self.allocator.is_reserved(ip) || self.allocator.is_allocated(ip) {
                    return Err(Error::AddressInUse(ip));
                }
                Ok(ip)
            }
            None => self
                .allocator
                .lowest_free()
                .ok_or_else(|| Error::RangeExhausted(self.name.clone())),
        }
    }

    /// Adopt a committed snapshot that added one allocation
    pub fn apply_allocation(&mut self, snapshot: PoolSnapshot, allocation: &Allocation) -> Result<()> {
        self.allocator.reserve(allocation.address)?;
        self.committed = snapshot;
        self.refresh_lifecycle();
        Ok(())
    }

    /// Adopt a committed snapshot that removed one allocation
    pub fn apply_release(&mut self, snapshot: PoolSnapshot, allocation: &Allocation) {
        self.allocator.release(allocation.address);
        self.orphans.remove(&allocation.key());
        self.committed = snapshot;
        self.refresh_lifecycle();
    }

    /// Adopt a committed snapshot with new assignment boundaries
    pub fn apply_assignment(&mut self, snapshot: PoolSnapshot) {
        if snapshot.generation != self.committed.generation {
            self.reported_generation = None;
        }
        self.allocator = build_allocator(&snapshot);
        self.committed = snapshot;
        self.refresh();
    }

    /// Generation to acknowledge when the draining assignment holds nothing,
    /// reported once per generation
    pub fn take_drained(&mut self) -> Option<u64> {
        let drained = self.committed.state == Some(AssignmentState::Draining)
            && !self.ranges.is_empty()
            && self
                .ranges
                .iter()
                .all(|r| r.lifecycle == RangeLifecycle::Released);
        if drained && self.reported_generation != Some(self.committed.generation) {
            self.reported_generation = Some(self.committed.generation);
            Some(self.committed.generation)
        } else {
            None
        }
    }

    /// Protocol response for an allocation
    pub fn response(&self, allocation: &Allocation) -> Result<AllocateResponse> {
        let meta = self.meta().ok_or_else(|| {
            Error::NotReady(format!("pool {} metadata not received yet", self.name))
        })?;
        let subnet = IpNet::new(allocation.address, meta.subnet.prefix_len())?;
        Ok(AllocateResponse {
            address: allocation.address,
            subnet,
            gateway: meta.gateway,
            routes: meta.routes.clone(),
        })
    }

    pub fn meta(&self) -> Option<&PoolMeta> {
        self.committed.meta.as_ref()
    }

    pub fn orphans(&self) -> impl Iterator<Item = &AllocationKey> {
        self.orphans.iter()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pool: self.name.clone(),
            state: self.committed.state,
            generation: self.committed.generation,
            subnet: self.meta().map(|m| m.subnet),
            ranges: self.ranges.clone(),
            allocated: self.committed.allocations.len(),
            available: u64::try_from(self.allocator.available_count()).unwrap_or(u64::MAX),
            orphans: self.orphans.iter().cloned().collect(),
        }
    }

    fn refresh(&mut self) {
        self.refresh_lifecycle();
        self.refresh_orphans();
    }

    fn refresh_lifecycle(&mut self) {
        let state = self.committed.state;
        self.ranges = self
            .committed
            .ranges
            .iter()
            .map(|range| {
                let allocated = self.allocator.allocated_in(range);
                let lifecycle = match state {
                    Some(AssignmentState::Active) => RangeLifecycle::Active,
                    _ if allocated == 0 => RangeLifecycle::Released,
                    _ => RangeLifecycle::Draining,
                };
                RangeStatus {
                    range: *range,
                    lifecycle,
                    allocated,
                }
            })
            .collect();
    }

    /// Allocations outside every owned range are flagged, never dropped
    fn refresh_orphans(&mut self) {
        let owned = &self.committed.ranges;
        let orphans: BTreeSet<AllocationKey> = self
            .committed
            .allocations
            .iter()
            .filter(|a| !owned.iter().any(|r| r.contains(a.address)))
            .map(|a| a.key())
            .collect();

        for key in orphans.difference(&self.orphans) {
            if let Some(allocation) = self.committed.find(key) {
                warn!(
                    pool = %self.name,
                    allocation = %key,
                    address = %allocation.address,
                    "Allocation lies outside every owned range, flagged orphaned"
                );
            }
        }
        let cleared = self.orphans.difference(&orphans).count();
        if cleared > 0 {
            info!(pool = %self.name, cleared, "Orphaned allocations back inside owned ranges");
        }
        self.orphans = orphans;
    }
}

fn family_of(snapshot: &PoolSnapshot) -> AddressFamily {
    snapshot
        .meta
        .as_ref()
        .map(|m| AddressFamily::of(&m.subnet.network()))
        .or_else(|| snapshot.ranges.first().map(|r| r.family()))
        .or_else(|| {
            snapshot
                .allocations
                .first()
                .map(|a| AddressFamily::of(&a.address))
        })
        .unwrap_or(AddressFamily::V4)
}

fn build_allocator(snapshot: &PoolSnapshot) -> RangeAllocator {
    let (exclusions, gateway) = match &snapshot.meta {
        Some(meta) => (meta.exclusions.as_slice(), meta.gateway),
        None => (&[][..], None),
    };
    let allocated: Vec<IpAddr> = snapshot.allocations.iter().map(|a| a.address).collect();
    let mut allocator = RangeAllocator::new(&snapshot.pool, family_of(snapshot), exclusions, gateway)
        .with_allocated(&allocated);
    if snapshot.state == Some(AssignmentState::Active) {
        allocator.set_active(&snapshot.ranges);
    }
    allocator
}
