//! Sled-based block store
//!
//! Persistent single-node block storage. Keys are the big-endian encoded
//! `BlockRef`, so a volume's blocks share an 8-byte prefix and iterate in
//! reference order.

use crate::backend::{BlockIterator, BlockStore, StorageStats};
use crate::StorageConfig;
use blockring_core::{BlockRef, BlockRingError, Result, VolumeId};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const BLOCKS_TREE: &str = "blocks";

fn storage_err(e: sled::Error) -> BlockRingError {
    BlockRingError::Storage(e.to_string())
}

/// Sled-based block store
pub struct SledBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    max_capacity: u64,
    bytes_used: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl SledBlockStore {
    /// Open or create a block store at `config.path`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        info!(path = ?config.path, "Opening Sled block store");

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .open()
            .map_err(|e| BlockRingError::Storage(format!("Failed to open Sled: {}", e)))?;

        Self::from_db(db, config.max_capacity)
    }

    /// Open at a bare path with default settings
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&StorageConfig::new(path.as_ref()))
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BlockRingError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db, 0)
    }

    fn from_db(db: sled::Db, max_capacity: u64) -> Result<Self> {
        let blocks = db.open_tree(BLOCKS_TREE).map_err(storage_err)?;

        // Rebuild usage accounting from what is already on disk
        let mut used = 0u64;
        for entry in blocks.iter() {
            let (_, value) = entry.map_err(storage_err)?;
            used += value.len() as u64;
        }
        debug!(blocks = blocks.len(), bytes = used, "Loaded block store");

        Ok(Self {
            db,
            blocks,
            max_capacity,
            bytes_used: AtomicU64::new(used),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Size of the database on disk
    pub fn size_on_disk(&self) -> Result<u64> {
        self.db.size_on_disk().map_err(storage_err)
    }
}

impl BlockStore for SledBlockStore {
    fn get_block(&self, block: &BlockRef) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let value = self.blocks.get(block.to_bytes()).map_err(storage_err)?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    fn write_block(&self, block: BlockRef, data: Bytes) -> Result<()> {
        let key = block.to_bytes();
        let data_len = data.len() as u64;

        if self.max_capacity > 0 {
            let replaced = self
                .blocks
                .get(key)
                .map_err(storage_err)?
                .map(|v| v.len() as u64)
                .unwrap_or(0);
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current.saturating_sub(replaced) + data_len > self.max_capacity {
                return Err(BlockRingError::StorageFull {
                    used: current,
                    capacity: self.max_capacity,
                });
            }
        }

        let old = self
            .blocks
            .insert(key, data.as_ref())
            .map_err(storage_err)?;
        if let Some(old) = old {
            self.bytes_used
                .fetch_sub(old.len() as u64, Ordering::SeqCst);
        }
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);

        debug!(block = %block, size = data_len, "Stored block");
        Ok(())
    }

    fn delete_block(&self, block: &BlockRef) -> Result<bool> {
        match self.blocks.remove(block.to_bytes()).map_err(storage_err)? {
            Some(old) => {
                self.bytes_used
                    .fetch_sub(old.len() as u64, Ordering::SeqCst);
                self.deletes.fetch_add(1, Ordering::Relaxed);
                debug!(block = %block, "Deleted block");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn has_block(&self, block: &BlockRef) -> Result<bool> {
        self.blocks
            .contains_key(block.to_bytes())
            .map_err(storage_err)
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn block_iterator(&self, volume: VolumeId) -> Result<BlockIterator> {
        let iter = self.blocks.scan_prefix(volume.key_prefix()).keys().map(|key| {
            let key = key.map_err(storage_err)?;
            BlockRef::from_bytes(&key)
        });
        Ok(Box::new(iter))
    }

    fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            block_count: self.blocks.len() as u64,
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            bytes_capacity: self.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block(volume: u64, inode: u64, index: u64) -> BlockRef {
        BlockRef::new(VolumeId(volume), inode, index)
    }

    #[test]
    fn test_write_get_delete() {
        let store = SledBlockStore::open_temporary().unwrap();
        let data = Bytes::from_static(b"block data");

        store.write_block(block(1, 1, 0), data.clone()).unwrap();
        assert!(store.has_block(&block(1, 1, 0)).unwrap());
        assert_eq!(store.get_block(&block(1, 1, 0)).unwrap().unwrap(), data);

        assert!(store.delete_block(&block(1, 1, 0)).unwrap());
        assert!(store.get_block(&block(1, 1, 0)).unwrap().is_none());
        assert_eq!(store.stats().unwrap().bytes_used, 0);
    }

    #[test]
    fn test_iterator_prefix() {
        let store = SledBlockStore::open_temporary().unwrap();
        store.write_block(block(1, 1, 0), Bytes::from_static(b"a")).unwrap();
        store.write_block(block(2, 1, 1), Bytes::from_static(b"b")).unwrap();
        store.write_block(block(2, 1, 0), Bytes::from_static(b"c")).unwrap();
        store.write_block(block(3, 0, 0), Bytes::from_static(b"d")).unwrap();

        let refs: Vec<BlockRef> = store
            .block_iterator(VolumeId(2))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(refs, vec![block(2, 1, 0), block(2, 1, 1)]);
    }

    #[test]
    fn test_reopen_restores_usage() {
        let dir = TempDir::new().unwrap();
        {
            let store = SledBlockStore::open_path(dir.path()).unwrap();
            store.write_block(block(1, 1, 0), Bytes::from(vec![7u8; 32])).unwrap();
            store.flush().unwrap();
        }

        let store = SledBlockStore::open_path(dir.path()).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.bytes_used, 32);
    }

    #[test]
    fn test_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path()).with_max_capacity(16);
        let store = SledBlockStore::open(&config).unwrap();

        store.write_block(block(1, 1, 0), Bytes::from(vec![0u8; 16])).unwrap();
        let result = store.write_block(block(1, 1, 1), Bytes::from(vec![0u8; 1]));
        assert!(matches!(result, Err(BlockRingError::StorageFull { .. })));
    }
}
