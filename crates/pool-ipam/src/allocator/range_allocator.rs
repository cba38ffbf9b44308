//! Address allocator over a node's active ranges
//!
//! Hands out the lowest free address across the active ranges of one pool.
//! Allocated addresses are tracked independently of the active ranges so an
//! address held in a draining or withdrawn range is never issued twice.

use crate::models::{addr_to_u128, u128_to_addr, AddrRange, AddressFamily};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Trait for address allocation within a pool
pub trait AddressAllocator: Send + Sync {
    /// Allocate the lowest available address
    fn allocate(&mut self) -> Option<IpAddr>;

    /// Claim a specific address
    fn reserve(&mut self, ip: IpAddr) -> Result<()>;

    /// Release a previously allocated address
    fn release(&mut self, ip: IpAddr);

    /// Check if an address is allocated or reserved
    fn is_allocated(&self, ip: IpAddr) -> bool;

    /// Number of addresses still available in the active ranges
    fn available_count(&self) -> u128;
}

/// Allocator for one pool on one node
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    /// Pool name, for error reporting
    pool: String,
    family: AddressFamily,
    /// Ranges currently serving new allocations, sorted and disjoint
    active: Vec<AddrRange>,
    /// Merged, sorted exclusion ranges
    exclusions: Vec<AddrRange>,
    /// Individually reserved addresses (gateway)
    reserved: BTreeSet<u128>,
    /// Addresses held by live allocations
    allocated: BTreeSet<u128>,
}

impl RangeAllocator {
    /// Create an allocator with no active range yet
    pub fn new(
        pool: impl Into<String>,
        family: AddressFamily,
        exclusions: &[AddrRange],
        reserved: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            pool: pool.into(),
            family,
            active: Vec::new(),
            exclusions: merge_ranges(exclusions),
            reserved: reserved
                .into_iter()
                .filter(|ip| AddressFamily::of(ip) == family)
                .map(addr_to_u128)
                .collect(),
            allocated: BTreeSet::new(),
        }
    }

    /// Restore allocator state from persisted allocations
    pub fn with_allocated(mut self, allocated: &[IpAddr]) -> Self {
        for ip in allocated {
            self.allocated.insert(addr_to_u128(*ip));
        }
        self
    }

    /// Replace the set of active ranges
    pub fn set_active(&mut self, ranges: &[AddrRange]) {
        self.active = merge_ranges(ranges);
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn in_active(&self, ip: IpAddr) -> bool {
        self.active.iter().any(|r| r.contains(ip))
    }

    pub fn is_excluded(&self, ip: IpAddr) -> bool {
        AddressFamily::of(&ip) == self.family && self.exclusion_at(addr_to_u128(ip)).is_some()
    }

    pub fn is_reserved(&self, ip: IpAddr) -> bool {
        AddressFamily::of(&ip) == self.family && self.reserved.contains(&addr_to_u128(ip))
    }

    /// Exclusion range covering a value, by binary search over merged ranges
    fn exclusion_at(&self, value: u128) -> Option<&AddrRange> {
        let idx = self.exclusions.partition_point(|e| e.hi() < value);
        self.exclusions.get(idx).filter(|e| e.lo() <= value)
    }

    fn is_blocked(&self, value: u128) -> bool {
        self.allocated.contains(&value) || self.reserved.contains(&value)
    }

    /// Lowest free value inside one range
    fn first_free_in(&self, range: &AddrRange) -> Option<u128> {
        let hi = range.hi();
        let mut candidate = range.lo();
        while candidate <= hi {
            if let Some(exclusion) = self.exclusion_at(candidate) {
                candidate = exclusion.hi().checked_add(1)?;
                continue;
            }
            if self.is_blocked(candidate) {
                candidate = candidate.checked_add(1)?;
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Lowest free address across the active ranges
    pub fn lowest_free(&self) -> Option<IpAddr> {
        self.active
            .iter()
            .find_map(|range| self.first_free_in(range))
            .map(|value| u128_to_addr(value, self.family))
    }

    /// Number of allocated addresses inside a range
    pub fn allocated_in(&self, range: &AddrRange) -> usize {
        self.allocated.range(range.lo()..=range.hi()).count()
    }

    fn excluded_len_in(&self, range: &AddrRange) -> u128 {
        self.exclusions
            .iter()
            .filter(|e| e.overlaps(range))
            .map(|e| e.hi().min(range.hi()) - e.lo().max(range.lo()) + 1)
            .sum()
    }
}

impl AddressAllocator for RangeAllocator {
    fn allocate(&mut self) -> Option<IpAddr> {
        let ip = self.lowest_free()?;
        self.allocated.insert(addr_to_u128(ip));
        Some(ip)
    }

    fn reserve(&mut self, ip: IpAddr) -> Result<()> {
        if !self.in_active(ip) || self.is_excluded(ip) {
            return Err(Error::AddressOutOfRange {
                address: ip,
                pool: self.pool.clone(),
            });
        }

        let value = addr_to_u128(ip);
        if self.is_blocked(value) {
            return Err(Error::AddressInUse(ip));
        }

        self.allocated.insert(value);
        Ok(())
    }

    fn release(&mut self, ip: IpAddr) {
        self.allocated.remove(&addr_to_u128(ip));
    }

    fn is_allocated(&self, ip: IpAddr) -> bool {
        AddressFamily::of(&ip) == self.family && self.is_blocked(addr_to_u128(ip))
    }

    fn available_count(&self) -> u128 {
        self.active
            .iter()
            .map(|range| {
                let excluded = self.excluded_len_in(range);
                let allocated = self
                    .allocated
                    .range(range.lo()..=range.hi())
                    .filter(|v| self.exclusion_at(**v).is_none())
                    .count() as u128;
                let reserved = self
                    .reserved
                    .range(range.lo()..=range.hi())
                    .filter(|v| self.exclusion_at(**v).is_none() && !self.allocated.contains(*v))
                    .count() as u128;
                range
                    .len()
                    .saturating_sub(excluded)
                    .saturating_sub(allocated + reserved)
            })
            .fold(0u128, |acc, n| acc.saturating_add(n))
    }
}

/// Sort ranges and merge overlapping or adjacent ones
pub fn merge_ranges(ranges: &[AddrRange]) -> Vec<AddrRange> {
    let mut sorted: Vec<AddrRange> = ranges.to_vec();
    sorted.sort_by_key(|r| (r.family(), r.lo()));

    let mut merged: Vec<AddrRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last)
                if last.family() == range.family()
                    && range.lo() <= last.hi().saturating_add(1) =>
            {
                if range.hi() > last.hi() {
                    *last = AddrRange::from_bounds(last.lo(), range.hi(), last.family());
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
