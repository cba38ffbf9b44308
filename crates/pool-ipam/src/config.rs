//! Configuration for the controller and node agent runtimes

use crate::partitioner::{BackoffConfig, PartitionPolicy, RemainderPolicy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable overriding the node name
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Default data directory of the node agent
pub const DEFAULT_DATA_DIR: &str = "/var/lib/pool-ipam";

/// Default port of the node-local API
pub const DEFAULT_API_PORT: u16 = 6543;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    /// Pool partitioner settings
    pub controller: ControllerConfig,

    /// Node agent settings
    pub node: NodeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Pool partitioner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Smallest block carved for a node by the even split
    pub min_block_size: u64,

    /// Where leftover addresses of an uneven split go
    pub remainder: RemainderPolicy,

    /// Interval of the full resync of every pool
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Retry backoff for failed reconciles
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_block_size: 8,
            remainder: RemainderPolicy::Spread,
            resync_interval: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn policy(&self) -> PartitionPolicy {
        PartitionPolicy::new(self.min_block_size, self.remainder)
    }
}

/// Node agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this node in the cluster (`NODE_NAME` overrides)
    pub node_name: Option<String>,

    /// Directory holding the allocation store
    pub data_dir: PathBuf,

    /// Upper bound on one durable-store write
    #[serde(with = "humantime_serde")]
    pub store_write_timeout: Duration,

    /// How long persistence may keep failing before the agent gives up
    #[serde(with = "humantime_serde")]
    pub persistence_failure_grace: Duration,

    /// Interval between garbage collection rounds
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,

    /// How long a container must be missing before its allocations are reclaimed
    #[serde(with = "humantime_serde")]
    pub gc_grace_period: Duration,

    /// Interval of the full assignment resync
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Retry backoff for release acknowledgements
    pub backoff: BackoffConfig,

    /// Node-local API
    pub api: ApiConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            store_write_timeout: Duration::from_secs(5),
            persistence_failure_grace: Duration::from_secs(30),
            gc_interval: Duration::from_secs(300),
            gc_grace_period: Duration::from_secs(600),
            resync_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Effective node name, the environment taking precedence
    pub fn resolve_node_name(&self) -> Result<String> {
        std::env::var(NODE_NAME_ENV)
            .ok()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.node_name.clone())
            .ok_or_else(|| {
                Error::Config(format!(
                    "node name not configured (set node.node_name or {})",
                    NODE_NAME_ENV
                ))
            })
    }
}

/// Node-local API listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid API address: {}", e)))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl IpamConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.controller.min_block_size == 0 {
            return Err(Error::Config(
                "controller.min_block_size must be at least 1".to_string(),
            ));
        }
        if self.controller.resync_interval.is_zero() || self.node.resync_interval.is_zero() {
            return Err(Error::Config("Resync interval must be positive".to_string()));
        }
        self.controller.backoff.validate()?;
        self.node.backoff.validate()?;

        if self.node.store_write_timeout.is_zero() {
            return Err(Error::Config(
                "node.store_write_timeout must be positive".to_string(),
            ));
        }
        if self.node.gc_interval.is_zero() {
            return Err(Error::Config("node.gc_interval must be positive".to_string()));
        }
        if self.node.api.port == 0 {
            return Err(Error::Config("Invalid port configuration".to_string()));
        }
        self.node.api.socket_addr()?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::Config("Invalid log level".to_string())),
        }

        Ok(())
    }

    /// Generate example configuration file content
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}
