//! Address allocations bound to container interfaces

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identity of an allocation within a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationKey {
    pub container_id: String,
    pub if_name: String,
}

impl AllocationKey {
    pub fn new(container_id: impl Into<String>, if_name: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            if_name: if_name.into(),
        }
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_id, self.if_name)
    }
}

/// Pod the allocation was made for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A live allocation, as persisted in the node store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub container_id: String,
    pub if_name: String,
    pub address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodRef>,
    pub timestamp: DateTime<Utc>,
}

impl Allocation {
    pub fn new(key: &AllocationKey, address: IpAddr, pod: Option<PodRef>) -> Self {
        Self {
            container_id: key.container_id.clone(),
            if_name: key.if_name.clone(),
            address,
            pod,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.container_id, &self.if_name)
    }
}
