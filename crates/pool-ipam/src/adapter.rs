//! Interface adapter
//!
//! Stateless translation of container-network-interface invocations into
//! engine calls. It holds no retry logic: repeated identical invocations are
//! made safe by the engine's idempotency alone.

use crate::error::{Error, ErrorCode};
use crate::models::PodRef;
use crate::protocol::{AllocateRequest, AllocationService, CheckRequest, ReleaseRequest};
use crate::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result schema version produced by the adapter
pub const CNI_VERSION: &str = "1.0.0";

/// Container-network-interface error code for "try again later"
pub const CNI_ERR_TRY_AGAIN: u32 = 11;

/// Container-network-interface error code for invalid configuration
pub const CNI_ERR_INVALID_CONFIG: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Add,
    Del,
    Check,
}

/// One pool of an invocation, optionally with a static address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRequest {
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_address: Option<IpAddr>,
}

impl PoolRequest {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            requested_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRequest {
    pub command: Command,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub if_name: String,
    /// One pool per address family
    pub pools: Vec<PoolRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<CniResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniIp {
    /// Address in CIDR form
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,
    #[serde(default)]
    pub ips: Vec<CniIp>,
    #[serde(default)]
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl From<&Error> for CniError {
    fn from(e: &Error) -> Self {
        let code = e.code();
        let numeric = match code {
            ErrorCode::InvalidRequest => CNI_ERR_INVALID_CONFIG,
            _ if e.is_retryable() => CNI_ERR_TRY_AGAIN,
            ErrorCode::Exhausted => 100,
            ErrorCode::InUse => 101,
            ErrorCode::OutOfRange => 102,
            ErrorCode::InconsistentState => 103,
            ErrorCode::NotFound => 104,
            ErrorCode::PersistenceFailure => 105,
            ErrorCode::NotReady => 106,
            ErrorCode::Internal => 199,
        };
        Self {
            cni_version: CNI_VERSION.to_string(),
            code: numeric,
            msg: e.to_string(),
            details: serde_json::to_value(code)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        }
    }
}

pub struct InterfaceAdapter {
    service: Arc<dyn AllocationService>,
}

impl InterfaceAdapter {
    pub fn new(service: Arc<dyn AllocationService>) -> Self {
        Self { service }
    }

    /// Run one invocation; `Add` yields a result, the others nothing
    pub async fn handle(
        &self,
        request: &AdapterRequest,
    ) -> std::result::Result<Option<CniResult>, CniError> {
        let outcome = match request.command {
            Command::Add => self.add(request).await.map(Some),
            Command::Del => self.del(request).await.map(|_| None),
            Command::Check => self.check(request).await.map(|_| None),
        };
        outcome.map_err(|e| CniError::from(&e))
    }

    /// Allocate in every pool, undoing earlier pools if a later one fails
    pub async fn add(&self, request: &AdapterRequest) -> Result<CniResult> {
        validate(request)?;
        let mut result = CniResult {
            cni_version: CNI_VERSION.to_string(),
            ips: Vec::new(),
            routes: Vec::new(),
        };
        let mut obtained: Vec<&str> = Vec::new();

        for pool in &request.pools {
            let mut allocate =
                AllocateRequest::new(&pool.pool, &request.container_id, &request.if_name);
            allocate.requested_address = pool.requested_address;
            allocate.pod = request.pod.clone();

            match self.service.allocate(allocate).await {
                Ok(response) => {
                    obtained.push(&pool.pool);
                    result.ips.push(CniIp {
                        address: response.subnet,
                        gateway: response.gateway,
                    });
                    result
                        .routes
                        .extend(response.routes.into_iter().map(|dst| CniRoute {
                            dst,
                            gw: response.gateway,
                        }));
                }
                Err(e) => {
                    self.rollback(request, &obtained).await;
                    return Err(e);
                }
            }
        }
        debug!(container_id = %request.container_id, ips = result.ips.len(), "Add completed");
        Ok(result)
    }

    /// Release in every pool; every pool is attempted, the first error wins
    pub async fn del(&self, request: &AdapterRequest) -> Result<()> {
        validate(request)?;
        let mut first_error = None;
        for pool in &request.pools {
            let release = ReleaseRequest::new(&pool.pool, &request.container_id, &request.if_name);
            if let Err(e) = self.service.release(release).await {
                warn!(pool = %pool.pool, container_id = %request.container_id, error = %e, "Release failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Compare the previous result with what the engine recorded
    pub async fn check(&self, request: &AdapterRequest) -> Result<()> {
        validate(request)?;
        let prev = request.prev_result.as_ref().ok_or_else(|| {
            Error::InvalidArgument("check requires the previous result".to_string())
        })?;
        if prev.ips.len() != request.pools.len() {
            return Err(Error::InvalidArgument(format!(
                "previous result holds {} addresses for {} pools",
                prev.ips.len(),
                request.pools.len()
            )));
        }
        for (pool, ip) in request.pools.iter().zip(&prev.ips) {
            let check = CheckRequest::new(
                &pool.pool,
                &request.container_id,
                &request.if_name,
                ip.address.addr(),
            );
            self.service.check(check).await?;
        }
        Ok(())
    }

    async fn rollback(&self, request: &AdapterRequest, pools: &[&str]) {
        for pool in pools {
            let release = ReleaseRequest::new(*pool, &request.container_id, &request.if_name);
            if let Err(e) = self.service.release(release).await {
                warn!(pool = %pool, container_id = %request.container_id, error = %e, "Rollback release failed");
            }
        }
    }
}

fn validate(request: &AdapterRequest) -> Result<()> {
    if request.container_id.is_empty() || request.if_name.is_empty() {
        return Err(Error::InvalidArgument(
            "containerID and ifName are required".to_string(),
        ));
    }
    if request.pools.is_empty() {
        return Err(Error::InvalidArgument("at least one pool is required".to_string()));
    }
    Ok(())
}
