//! Local allocation protocol between the interface adapter and the engine

use crate::error::{Error, ErrorCode};
use crate::models::{AllocationKey, PodRef};
use crate::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub pool: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodRef>,
}

impl AllocateRequest {
    pub fn new(
        pool: impl Into<String>,
        container_id: impl Into<String>,
        if_name: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            container_id: container_id.into(),
            if_name: if_name.into(),
            requested_address: None,
            pod: None,
        }
    }

    pub fn with_requested_address(mut self, address: IpAddr) -> Self {
        self.requested_address = Some(address);
        self
    }

    pub fn with_pod(mut self, pod: PodRef) -> Self {
        self.pod = Some(pod);
        self
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.container_id, &self.if_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub address: IpAddr,
    /// Address with the pool's prefix length
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub routes: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub pool: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub if_name: String,
}

impl ReleaseRequest {
    pub fn new(
        pool: impl Into<String>,
        container_id: impl Into<String>,
        if_name: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            container_id: container_id.into(),
            if_name: if_name.into(),
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.container_id, &self.if_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub pool: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub if_name: String,
    pub address: IpAddr,
}

impl CheckRequest {
    pub fn new(
        pool: impl Into<String>,
        container_id: impl Into<String>,
        if_name: impl Into<String>,
        address: IpAddr,
    ) -> Self {
        Self {
            pool: pool.into(),
            container_id: container_id.into(),
            if_name: if_name.into(),
            address,
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.container_id, &self.if_name)
    }
}

/// Error as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl From<&Error> for ProtocolError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<Error> for ProtocolError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

/// The three operations the engine serves to the adapter
#[async_trait]
pub trait AllocationService: Send + Sync {
    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse>;

    async fn release(&self, request: ReleaseRequest) -> Result<()>;

    async fn check(&self, request: CheckRequest) -> Result<()>;
}
