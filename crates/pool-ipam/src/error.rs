//! Error types for pool partitioning and node allocation

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type for IPAM operations
pub type Result<T> = std::result::Result<T, Error>;

/// IPAM errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Capacity errors
    #[error("Pool {pool} exhausted, no range left for nodes: {}", unplaced.join(", "))]
    PoolExhausted { pool: String, unplaced: Vec<String> },

    #[error("No free address in the active ranges of pool {0}")]
    RangeExhausted(String),

    // Static request conflicts
    #[error("Address {0} is already in use")]
    AddressInUse(IpAddr),

    #[error("Address {address} is outside the active ranges of pool {pool}")]
    AddressOutOfRange { address: IpAddr, pool: String },

    // Readiness
    #[error("Not ready: {0}")]
    NotReady(String),

    // Check / release mismatches
    #[error("Inconsistent state: recorded {recorded}, reported {reported}")]
    InconsistentState { recorded: IpAddr, reported: IpAddr },

    #[error("No allocation for {container_id}/{if_name} in pool {pool}")]
    NotFound {
        pool: String,
        container_id: String,
        if_name: String,
    },

    // Durability
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Durable write did not complete within {0:?}")]
    PersistenceTimeout(Duration),

    #[error("Persistence failing beyond grace period: {0}")]
    PersistenceFatal(String),

    // Pool definition errors
    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Invalid pool {pool}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Collaborators
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-level error code of the local allocation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Exhausted,
    InUse,
    OutOfRange,
    NotReady,
    InconsistentState,
    NotFound,
    PersistenceFailure,
    InvalidRequest,
    Internal,
}

impl Error {
    /// Protocol code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::PoolExhausted { .. } | Error::RangeExhausted(_) => ErrorCode::Exhausted,
            Error::AddressInUse(_) => ErrorCode::InUse,
            Error::AddressOutOfRange { .. } => ErrorCode::OutOfRange,
            Error::NotReady(_) | Error::PoolNotFound(_) => ErrorCode::NotReady,
            Error::InconsistentState { .. } => ErrorCode::InconsistentState,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::PersistenceFailure(_)
            | Error::PersistenceTimeout(_)
            | Error::PersistenceFatal(_) => ErrorCode::PersistenceFailure,
            Error::InvalidPool { .. } | Error::InvalidCidr(_) | Error::InvalidArgument(_) => {
                ErrorCode::InvalidRequest
            }
            Error::Registry(_) | Error::Config(_) | Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::RangeExhausted(_)
                | Error::NotReady(_)
                | Error::PoolNotFound(_)
                | Error::PersistenceFailure(_)
                | Error::PersistenceTimeout(_)
                | Error::Registry(_)
        )
    }

    pub(crate) fn invalid_pool(pool: &str, reason: impl Into<String>) -> Self {
        Error::InvalidPool {
            pool: pool.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
