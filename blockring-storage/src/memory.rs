//! In-memory block store
//!
//! Used for testing and development. Not persistent.

use crate::backend::{BlockIterator, BlockStore, StorageStats};
use blockring_core::{BlockRef, BlockRingError, Result, VolumeId};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory block store
pub struct MemoryBlockStore {
    /// Block storage, ordered so a volume's blocks are contiguous
    blocks: RwLock<BTreeMap<BlockRef, Bytes>>,

    /// Maximum capacity (0 = unlimited)
    max_capacity: u64,

    /// Current bytes used
    bytes_used: AtomicU64,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryBlockStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with a maximum capacity
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            blocks: RwLock::new(BTreeMap::new()),
            max_capacity: max_bytes,
            bytes_used: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// All references currently stored, in key order
    pub fn refs(&self) -> Vec<BlockRef> {
        self.blocks.read().keys().copied().collect()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get_block(&self, block: &BlockRef) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.blocks.read().get(block).cloned())
    }

    fn write_block(&self, block: BlockRef, data: Bytes) -> Result<()> {
        let data_len = data.len() as u64;
        let mut blocks = self.blocks.write();
        let replaced = blocks.get(&block).map(|old| old.len() as u64).unwrap_or(0);

        // Check capacity
        if self.max_capacity > 0 {
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current - replaced + data_len > self.max_capacity {
                return Err(BlockRingError::StorageFull {
                    used: current,
                    capacity: self.max_capacity,
                });
            }
        }

        blocks.insert(block, data);
        self.bytes_used.fetch_sub(replaced, Ordering::SeqCst);
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn delete_block(&self, block: &BlockRef) -> Result<bool> {
        let mut blocks = self.blocks.write();

        if let Some(old) = blocks.remove(block) {
            self.bytes_used
                .fetch_sub(old.len() as u64, Ordering::SeqCst);
            self.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn has_block(&self, block: &BlockRef) -> Result<bool> {
        Ok(self.blocks.read().contains_key(block))
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.read().len() as u64)
    }

    fn block_iterator(&self, volume: VolumeId) -> Result<BlockIterator> {
        let start = BlockRef::new(volume, 0, 0);
        let end = BlockRef::new(volume, u64::MAX, u64::MAX);
        let refs: Vec<BlockRef> = self
            .blocks
            .read()
            .range(start..=end)
            .map(|(r, _)| *r)
            .collect();
        Ok(Box::new(refs.into_iter().map(Ok)))
    }

    fn stats(&self) -> Result<StorageStats> {
        let blocks = self.blocks.read();
        Ok(StorageStats {
            block_count: blocks.len() as u64,
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            bytes_capacity: self.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
