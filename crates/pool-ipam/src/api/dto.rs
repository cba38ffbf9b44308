//! Data Transfer Objects for the REST API

use crate::engine::PoolStatus;
use crate::models::Allocation;
use serde::Serialize;

pub use crate::protocol::ProtocolError as ApiError;

/// Allocations of one pool
#[derive(Debug, Clone, Serialize)]
pub struct AllocationsResponse {
    pub pool: String,
    pub items: Vec<Allocation>,
    pub total: usize,
}

/// Pools on this node
#[derive(Debug, Clone, Serialize)]
pub struct PoolsResponse {
    pub node: String,
    pub items: Vec<PoolStatus>,
}
