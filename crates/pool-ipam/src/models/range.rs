//! Inclusive address ranges
//!
//! Addresses of both families are handled as `u128` offsets so one set of
//! range operations serves IPv4 and IPv6 pools alike.

use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Address width in bits
    pub fn bits(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Convert an address to its numeric value
pub fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Convert a numeric value back to an address of the given family
pub fn u128_to_addr(value: u128, family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Inclusive `start..=end` range of addresses of a single family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddrRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddrRange {
    /// Create a range, validating family and ordering
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self> {
        if AddressFamily::of(&start) != AddressFamily::of(&end) {
            return Err(Error::InvalidArgument(format!(
                "range {}-{} mixes address families",
                start, end
            )));
        }
        if addr_to_u128(start) > addr_to_u128(end) {
            return Err(Error::InvalidArgument(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range holding exactly one address
    pub fn single(addr: IpAddr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// Every address of a network, including network and broadcast
    pub fn from_net(net: IpNet) -> Self {
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }

    /// Build from numeric bounds; callers guarantee `lo <= hi`
    pub(crate) fn from_bounds(lo: u128, hi: u128, family: AddressFamily) -> Self {
        debug_assert!(lo <= hi);
        Self {
            start: u128_to_addr(lo, family),
            end: u128_to_addr(hi, family),
        }
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.start)
    }

    /// Numeric first address
    pub fn lo(&self) -> u128 {
        addr_to_u128(self.start)
    }

    /// Numeric last address
    pub fn hi(&self) -> u128 {
        addr_to_u128(self.end)
    }

    /// Number of addresses, saturating for the full IPv6 space
    pub fn len(&self) -> u128 {
        (self.hi() - self.lo()).saturating_add(1)
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        if AddressFamily::of(&addr) != self.family() {
            return false;
        }
        let value = addr_to_u128(addr);
        value >= self.lo() && value <= self.hi()
    }

    pub fn contains_range(&self, other: &AddrRange) -> bool {
        self.family() == other.family() && other.lo() >= self.lo() && other.hi() <= self.hi()
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.family() == other.family() && self.lo() <= other.hi() && other.lo() <= self.hi()
    }

    /// Smallest network covering the whole range
    pub fn covering_net(&self) -> IpNet {
        let family = self.family();
        let diff = self.lo() ^ self.hi();
        let significant = (128 - diff.leading_zeros()) as u8;
        let prefix = family.bits() - significant;
        // prefix is always within the family width
        IpNet::new(self.start, prefix)
            .map(|net| net.trunc())
            .unwrap_or_else(|_| IpNet::from(self.start))
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for AddrRange {
    type Err = Error;

    /// Accepts `addr`, `start-end` or a CIDR
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            return AddrRange::new(start.trim().parse()?, end.trim().parse()?);
        }
        if s.contains('/') {
            return Ok(AddrRange::from_net(s.parse::<IpNet>()?));
        }
        Ok(AddrRange::single(s.parse()?))
    }
}

/// Total number of addresses across ranges
pub fn total_len(ranges: &[AddrRange]) -> u128 {
    ranges
        .iter()
        .fold(0u128, |acc, range| acc.saturating_add(range.len()))
}
