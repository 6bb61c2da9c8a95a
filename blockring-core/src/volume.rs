//! Volume descriptors and cluster-wide settings

use crate::block::VolumeId;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_REPLICATION};
use serde::{Deserialize, Serialize};

/// Kind of data a volume carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Block,
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
        }
    }
}

/// Named storage unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume name
    pub name: String,
    /// Numeric id embedded in every block reference
    pub id: VolumeId,
    /// Size of each block in bytes
    pub block_size: u64,
    pub kind: VolumeKind,
}

impl Volume {
    /// Create a block volume with the default block size
    pub fn block(name: impl Into<String>, id: VolumeId) -> Self {
        Self {
            name: name.into(),
            id,
            block_size: DEFAULT_BLOCK_SIZE,
            kind: VolumeKind::Block,
        }
    }

    /// Set the block size
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }
}

/// Cluster-wide settings shared with transports and rings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadata {
    /// Block size in bytes; transports size their frames from it
    pub block_size: u64,
    /// Number of authorized holders per block
    pub replication: usize,
}

impl Default for GlobalMetadata {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            replication: DEFAULT_REPLICATION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_builder() {
        let vol = Volume::block("data", VolumeId(3)).with_block_size(4096);
        assert_eq!(vol.name, "data");
        assert_eq!(vol.block_size, 4096);
        assert_eq!(vol.kind.to_string(), "block");
    }

    #[test]
    fn test_global_metadata_default() {
        let gmd = GlobalMetadata::default();
        assert_eq!(gmd.block_size, 512 * 1024);
        assert_eq!(gmd.replication, 2);
    }
}
