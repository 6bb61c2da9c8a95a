//! blockring Storage Backend
//!
//! The local block store consumed by the rebalancer and the RPC handler:
//! - `BlockStore` trait for pluggable local stores
//! - `MemoryBlockStore` for testing
//! - `SledBlockStore` for persistent single-node storage

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{open_store, BlockIterator, BlockStore, StorageStats};
pub use memory::MemoryBlockStore;
pub use sled_backend::SledBlockStore;

use serde::{Deserialize, Serialize};

/// Which local store to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[default]
    Sled,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "sled" => Ok(Self::Sled),
            other => Err(format!("unknown storage kind: {}", other)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store implementation
    pub kind: StorageKind,

    /// Path to storage directory
    pub path: std::path::PathBuf,

    /// Maximum storage capacity in bytes (0 = unlimited)
    pub max_capacity: u64,

    /// Sled page cache size in bytes
    pub cache_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Sled,
            path: std::path::PathBuf::from("./blockring_data/blocks"),
            max_capacity: 0, // Unlimited
            cache_size: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// In-memory store, nothing touches disk
    pub fn memory() -> Self {
        Self {
            kind: StorageKind::Memory,
            ..Default::default()
        }
    }

    /// Set maximum capacity
    pub fn with_max_capacity(mut self, bytes: u64) -> Self {
        self.max_capacity = bytes;
        self
    }

    /// Set cache size
    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }
}
