//! Node configuration
//!
//! Loaded from a TOML file, then overridden by `BLOCKRING_*` environment
//! variables, then by command line flags.

use blockring_metadata::{MetadataConfig, MetadataKind};
use blockring_network::PeerUrl;
use blockring_storage::{StorageConfig, StorageKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub rebalance: RebalanceSettings,

    /// Peer id -> URL
    #[serde(default)]
    pub peers: BTreeMap<String, String>,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(path = ?path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "node id cannot be empty".to_string(),
            ));
        }
        if self.rebalance.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance batch size cannot be 0".to_string(),
            ));
        }
        if self.rebalance.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance tick interval cannot be 0".to_string(),
            ));
        }
        if self.rebalance.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "peer request timeout cannot be 0".to_string(),
            ));
        }
        if self.metadata.lease_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "lease TTL cannot be 0".to_string(),
            ));
        }
        self.listen_url()?;
        self.peer_urls()?;
        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        node_id: Option<String>,
        listen: Option<String>,
        data_dir: Option<PathBuf>,
        batch_size: Option<usize>,
        metrics_port: Option<u16>,
    ) -> Self {
        if let Some(id) = node_id {
            self.node.id = id;
        }
        if let Some(listen) = listen {
            self.node.listen = listen;
        }
        if let Some(dir) = data_dir {
            self.storage.path = dir.join("blocks");
            self.metadata.path = dir.join("metadata");
        }
        if let Some(size) = batch_size {
            self.rebalance.batch_size = size;
        }
        if let Some(port) = metrics_port {
            self.metrics.port = Some(port);
        }
        self
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(id) = var("BLOCKRING_NODE_ID") {
            self.node.id = id;
        }
        if let Some(listen) = var("BLOCKRING_LISTEN") {
            self.node.listen = listen;
        }
        if let Some(dir) = var("BLOCKRING_DATA_DIR") {
            let dir = PathBuf::from(dir);
            self.storage.path = dir.join("blocks");
            self.metadata.path = dir.join("metadata");
        }
        if let Some(kind) = var("BLOCKRING_STORAGE_KIND") {
            self.storage.kind = kind
                .parse::<StorageKind>()
                .map_err(|e| ConfigError::InvalidValue("BLOCKRING_STORAGE_KIND".into(), e))?;
        }
        if let Some(kind) = var("BLOCKRING_METADATA_KIND") {
            self.metadata.kind = kind.parse::<MetadataKind>().map_err(|e| {
                ConfigError::InvalidValue("BLOCKRING_METADATA_KIND".into(), e.to_string())
            })?;
        }
        if let Some(size) = var("BLOCKRING_BATCH_SIZE") {
            self.rebalance.batch_size = parse_var("BLOCKRING_BATCH_SIZE", &size)?;
        }
        if let Some(ms) = var("BLOCKRING_TICK_INTERVAL_MS") {
            self.rebalance.tick_interval_ms = parse_var("BLOCKRING_TICK_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = var("BLOCKRING_REQUEST_TIMEOUT_MS") {
            self.rebalance.request_timeout_ms = parse_var("BLOCKRING_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(port) = var("BLOCKRING_METRICS_PORT") {
            self.metrics.port = Some(parse_var("BLOCKRING_METRICS_PORT", &port)?);
        }
        // "id=url,id=url"
        if let Some(peers) = var("BLOCKRING_PEERS") {
            for entry in peers.split(',').filter(|e| !e.trim().is_empty()) {
                let (id, url) = entry.split_once('=').ok_or_else(|| {
                    ConfigError::InvalidValue("BLOCKRING_PEERS".into(), entry.to_string())
                })?;
                self.peers
                    .insert(id.trim().to_string(), url.trim().to_string());
            }
        }
        Ok(self)
    }

    /// Parsed listen URL
    pub fn listen_url(&self) -> Result<PeerUrl, ConfigError> {
        self.node
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidValue("node.listen".into(), self.node.listen.clone()))
    }

    /// Parsed peer table
    pub fn peer_urls(&self) -> Result<Vec<(String, PeerUrl)>, ConfigError> {
        self.peers
            .iter()
            .map(|(id, url)| {
                url.parse()
                    .map(|parsed| (id.clone(), parsed))
                    .map_err(|_| ConfigError::InvalidValue(format!("peers.{}", id), url.clone()))
            })
            .collect()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Peer id of this node as it appears in the ring
    #[serde(default = "default_node_id")]
    pub id: String,

    /// URL to serve peers on
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            listen: default_listen(),
        }
    }
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "blockring-node".to_string())
}

fn default_listen() -> String {
    "tdp://0.0.0.0".to_string()
}

/// Rebalancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceSettings {
    /// Blocks examined per tick
    pub batch_size: usize,

    /// Pause between ticks once a pass has caught up
    pub tick_interval_ms: u64,

    /// Timeout for dialing a peer
    pub dial_timeout_ms: u64,

    /// Deadline for a single check or transfer on an open connection
    pub request_timeout_ms: u64,

    /// Interval between GC sweeps
    pub sweep_interval_secs: u64,

    /// Volumes to rebalance; empty means every volume
    pub volumes: Vec<String>,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            tick_interval_ms: 1000,
            dial_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            sweep_interval_secs: 30,
            volumes: Vec::new(),
        }
    }
}

impl RebalanceSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Metrics endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Prometheus port; disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}
