//! Pool definitions and admission validation
//!
//! [`PoolSpec`] is the loosely typed record published through the cluster
//! API. It is turned into a [`Pool`] exactly once, at admission, so the
//! partitioner and the node engine only ever see validated pools.

use super::assignment::PoolMeta;
use super::range::{AddrRange, AddressFamily};
use super::selector::NodeSelector;
use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Maximum length of a pool name
const MAX_NAME_LEN: usize = 253;

/// Explicit start/end range of a pool definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: String,
    pub end: String,
}

/// Pool definition as declared by the operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Pool name (immutable identity)
    pub name: String,
    /// Subnet in CIDR form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Explicit allocatable range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeSpec>,
    /// Addresses, `start-end` ranges or CIDRs never handed out
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Nodes eligible for a share of the pool
    #[serde(default)]
    pub node_selector: NodeSelector,
    /// Fixed number of addresses carved per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_node_block_size: Option<u64>,
    /// Gateway reported with every allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Extra route destinations reported with every allocation
    #[serde(default)]
    pub routes: Vec<String>,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: set the subnet
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = Some(subnet.into());
        self
    }

    /// Builder: set an explicit range
    pub fn with_range(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.range = Some(RangeSpec {
            start: start.into(),
            end: end.into(),
        });
        self
    }

    /// Builder: add an exclusion
    pub fn with_exclusion(mut self, exclusion: impl Into<String>) -> Self {
        self.exclusions.push(exclusion.into());
        self
    }

    /// Builder: set the node selector
    pub fn with_selector(mut self, selector: NodeSelector) -> Self {
        self.node_selector = selector;
        self
    }

    /// Builder: set the per-node block size
    pub fn with_block_size(mut self, size: u64) -> Self {
        self.per_node_block_size = Some(size);
        self
    }

    /// Builder: set the gateway
    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Builder: add a route destination
    pub fn with_route(mut self, dst: impl Into<String>) -> Self {
        self.routes.push(dst.into());
        self
    }

    /// Validate into a structured pool, rejecting anything malformed
    pub fn validate(&self) -> Result<Pool> {
        let name = self.name.as_str();
        validate_name(name)?;

        let subnet = match &self.subnet {
            Some(s) => Some(
                s.trim()
                    .parse::<IpNet>()
                    .map_err(|e| Error::invalid_pool(name, format!("subnet {}: {}", s, e)))?
                    .trunc(),
            ),
            None => None,
        };

        let range = match &self.range {
            Some(spec) => {
                let start: IpAddr = spec.start.trim().parse().map_err(|e| {
                    Error::invalid_pool(name, format!("range start {}: {}", spec.start, e))
                })?;
                let end: IpAddr = spec.end.trim().parse().map_err(|e| {
                    Error::invalid_pool(name, format!("range end {}: {}", spec.end, e))
                })?;
                Some(
                    AddrRange::new(start, end)
                        .map_err(|e| Error::invalid_pool(name, e.to_string()))?,
                )
            }
            None => None,
        };

        let (subnet, span) = match (subnet, range) {
            (Some(subnet), Some(range)) => {
                if !AddrRange::from_net(subnet).contains_range(&range) {
                    return Err(Error::invalid_pool(
                        name,
                        format!("range {} is not inside subnet {}", range, subnet),
                    ));
                }
                (subnet, range)
            }
            (Some(subnet), None) => (subnet, usable_span(subnet)),
            (None, Some(range)) => (range.covering_net(), range),
            (None, None) => {
                return Err(Error::invalid_pool(name, "either subnet or range is required"))
            }
        };
        let family = span.family();
        let subnet_range = AddrRange::from_net(subnet);

        let mut exclusions = Vec::with_capacity(self.exclusions.len());
        for raw in &self.exclusions {
            let exclusion: AddrRange = raw
                .parse()
                .map_err(|e| Error::invalid_pool(name, format!("exclusion {}: {}", raw, e)))?;
            if !subnet_range.contains_range(&exclusion) {
                return Err(Error::invalid_pool(
                    name,
                    format!("exclusion {} is not inside subnet {}", exclusion, subnet),
                ));
            }
            exclusions.push(exclusion);
        }
        exclusions.sort();

        let gateway = match &self.gateway {
            Some(raw) => {
                let gw: IpAddr = raw
                    .trim()
                    .parse()
                    .map_err(|e| Error::invalid_pool(name, format!("gateway {}: {}", raw, e)))?;
                if !subnet.contains(&gw) {
                    return Err(Error::invalid_pool(
                        name,
                        format!("gateway {} is not inside subnet {}", gw, subnet),
                    ));
                }
                Some(gw)
            }
            None => None,
        };

        let mut routes = Vec::with_capacity(self.routes.len());
        for raw in &self.routes {
            let dst: IpNet = raw
                .trim()
                .parse()
                .map_err(|e| Error::invalid_pool(name, format!("route {}: {}", raw, e)))?;
            if AddressFamily::of(&dst.network()) != family {
                return Err(Error::invalid_pool(
                    name,
                    format!("route {} does not match pool family {}", dst, family),
                ));
            }
            routes.push(dst.trunc());
        }

        if let Some(size) = self.per_node_block_size {
            if size == 0 {
                return Err(Error::invalid_pool(name, "perNodeBlockSize must be at least 1"));
            }
            if size as u128 > span.len() {
                return Err(Error::invalid_pool(
                    name,
                    format!(
                        "perNodeBlockSize {} exceeds the {} addresses of the pool",
                        size,
                        span.len()
                    ),
                ));
            }
        }

        self.node_selector
            .validate()
            .map_err(|reason| Error::invalid_pool(name, reason))?;

        Ok(Pool {
            name: name.to_string(),
            family,
            subnet,
            span,
            exclusions,
            gateway,
            routes,
            node_selector: self.node_selector.clone(),
            per_node_block_size: self.per_node_block_size,
        })
    }
}

/// A validated pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub family: AddressFamily,
    /// Subnet reported with allocations
    pub subnet: IpNet,
    /// Address space the partitioner carves from
    pub span: AddrRange,
    pub exclusions: Vec<AddrRange>,
    pub gateway: Option<IpAddr>,
    pub routes: Vec<IpNet>,
    pub node_selector: NodeSelector,
    pub per_node_block_size: Option<u64>,
}

impl Pool {
    /// Metadata shipped to nodes inside assignment records
    pub fn meta(&self) -> PoolMeta {
        PoolMeta {
            subnet: self.subnet,
            gateway: self.gateway,
            exclusions: self.exclusions.clone(),
            routes: self.routes.clone(),
        }
    }
}

/// Allocatable addresses of a subnet: no network address, no IPv4 broadcast,
/// point-to-point and host prefixes are used whole
fn usable_span(subnet: IpNet) -> AddrRange {
    let whole = AddrRange::from_net(subnet);
    let family = whole.family();
    let (lo, hi) = (whole.lo(), whole.hi());
    match family {
        AddressFamily::V4 if subnet.prefix_len() <= 30 => {
            AddrRange::from_bounds(lo + 1, hi - 1, family)
        }
        AddressFamily::V6 if subnet.prefix_len() <= 126 => AddrRange::from_bounds(lo + 1, hi, family),
        _ => whole,
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_pool(
            name,
            format!("name must be 1-{} characters", MAX_NAME_LEN),
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let alnum_edges = name
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .last()
            .map_or(false, |c| c.is_ascii_alphanumeric());
    if !valid_chars || !alnum_edges {
        return Err(Error::invalid_pool(
            name,
            "name must consist of lowercase alphanumerics, '-' or '.'",
        ));
    }
    Ok(())
}
