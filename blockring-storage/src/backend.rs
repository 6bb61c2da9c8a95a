//! Block store trait
//!
//! Defines the interface every local block store must follow.

use crate::memory::MemoryBlockStore;
use crate::sled_backend::SledBlockStore;
use crate::{StorageConfig, StorageKind};
use blockring_core::{BlockRef, Result, VolumeId};
use bytes::Bytes;
use std::sync::Arc;

/// Iterator over the block references of one volume
///
/// Dropping the iterator releases it.
pub type BlockIterator = Box<dyn Iterator<Item = Result<BlockRef>> + Send>;

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Total number of blocks stored
    pub block_count: u64,

    /// Total bytes used by blocks
    pub bytes_used: u64,

    /// Total storage capacity (0 = unlimited)
    pub bytes_capacity: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

impl StorageStats {
    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.bytes_capacity == 0 {
            0.0
        } else {
            (self.bytes_used as f64 / self.bytes_capacity as f64) * 100.0
        }
    }

    /// Check if storage is full
    pub fn is_full(&self) -> bool {
        self.bytes_capacity > 0 && self.bytes_used >= self.bytes_capacity
    }
}

/// Local block store
///
/// Writes of an existing reference overwrite it.
pub trait BlockStore: Send + Sync {
    /// Retrieve a block
    fn get_block(&self, block: &BlockRef) -> Result<Option<Bytes>>;

    /// Store a block
    fn write_block(&self, block: BlockRef, data: Bytes) -> Result<()>;

    /// Delete a block, returning whether it existed
    fn delete_block(&self, block: &BlockRef) -> Result<bool>;

    /// Check if a block exists
    fn has_block(&self, block: &BlockRef) -> Result<bool>;

    /// Number of blocks across all volumes
    fn num_blocks(&self) -> Result<u64>;

    /// Iterate over the blocks of one volume in key order
    fn block_iterator(&self, volume: VolumeId) -> Result<BlockIterator>;

    /// Get storage statistics
    fn stats(&self) -> Result<StorageStats>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}

/// Open the store selected by `config.kind`
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn BlockStore>> {
    match config.kind {
        StorageKind::Memory => Ok(Arc::new(MemoryBlockStore::with_capacity(
            config.max_capacity,
        ))),
        StorageKind::Sled => Ok(Arc::new(SledBlockStore::open(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_usage() {
        let stats = StorageStats {
            bytes_used: 250,
            bytes_capacity: 1000,
            ..Default::default()
        };
        assert_eq!(stats.usage_percent(), 25.0);
        assert!(!stats.is_full());

        let unlimited = StorageStats::default();
        assert_eq!(unlimited.usage_percent(), 0.0);
        assert!(!unlimited.is_full());
    }

    #[test]
    fn test_open_memory_store() {
        let store = open_store(&StorageConfig::memory()).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 0);
    }
}
