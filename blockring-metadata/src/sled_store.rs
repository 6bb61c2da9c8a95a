//! Sled-based metadata backend
//!
//! Trees:
//! - `volumes`: name → `Volume`
//! - `leases`: volume id → `LeaseRecord`, acquired with compare-and-swap
//! - `inodes`: volume id → `INodeRef`
//! - `snapshots`: volume id ++ sequence → `Snapshot`
//! - `snapshot_names`: volume id ++ name → sequence
//! - `meta`: global metadata

use crate::backend::{MetadataBackend, MetadataKind};
use crate::models::{now_ms, LeaseId, LeaseRecord, Snapshot};
use async_trait::async_trait;
use blockring_core::{BlockRingError, GlobalMetadata, INodeRef, Result, Volume, VolumeId};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::Transactional;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const GLOBAL_KEY: &[u8] = b"global";

fn storage_err(e: sled::Error) -> BlockRingError {
    BlockRingError::Storage(e.to_string())
}

fn committed<T>(result: TransactionResult<T, BlockRingError>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(storage_err(e)),
    }
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    Ok(bincode::deserialize(bytes)?)
}

fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn snapshot_name_key(volume: VolumeId, name: &str) -> Vec<u8> {
    let mut key = volume.key_prefix().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

/// Sled-based (`sled`) metadata backend
pub struct SledMetadata {
    db: sled::Db,
    volumes: sled::Tree,
    leases: sled::Tree,
    inodes: sled::Tree,
    snapshots: sled::Tree,
    snapshot_names: sled::Tree,
    meta: sled::Tree,
}

impl SledMetadata {
    /// Open or create a metadata database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled metadata store");

        let db = sled::open(path.as_ref())
            .map_err(|e| BlockRingError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BlockRingError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(storage_err);
        Ok(Self {
            volumes: tree("volumes")?,
            leases: tree("leases")?,
            inodes: tree("inodes")?,
            snapshots: tree("snapshots")?,
            snapshot_names: tree("snapshot_names")?,
            meta: tree("meta")?,
            db,
        })
    }

    fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id().map_err(storage_err)? + 1)
    }

    fn live_lease(&self, volume: VolumeId) -> Result<Option<LeaseRecord>> {
        let now = now_ms();
        match self.leases.get(volume.key_prefix()).map_err(storage_err)? {
            Some(raw) => {
                let record: LeaseRecord = decode(&raw)?;
                Ok(record.is_live(now).then_some(record))
            }
            None => Ok(None),
        }
    }

    fn require_volume(&self, volume: VolumeId) -> Result<()> {
        if self
            .inodes
            .contains_key(volume.key_prefix())
            .map_err(storage_err)?
        {
            Ok(())
        } else {
            Err(BlockRingError::VolumeNotFound(volume.to_string()))
        }
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataBackend for SledMetadata {
    fn kind(&self) -> MetadataKind {
        MetadataKind::Sled
    }

    async fn global_metadata(&self) -> Result<GlobalMetadata> {
        match self.meta.get(GLOBAL_KEY).map_err(storage_err)? {
            Some(raw) => decode(&raw),
            None => Ok(GlobalMetadata::default()),
        }
    }

    async fn set_global_metadata(&self, global: GlobalMetadata) -> Result<()> {
        self.meta
            .insert(GLOBAL_KEY, encode(&global)?)
            .map_err(storage_err)?;
        Ok(())
    }

    async fn create_volume(&self, name: &str, block_size: u64) -> Result<Volume> {
        let id = VolumeId(self.next_id()?);
        let volume = Volume::block(name, id).with_block_size(block_size);

        // Claim the name first; a losing racer never touches the inode tree
        let claimed = self
            .volumes
            .compare_and_swap(name.as_bytes(), None as Option<&[u8]>, Some(encode(&volume)?))
            .map_err(storage_err)?;
        if claimed.is_err() {
            return Err(BlockRingError::AlreadyExists(format!("volume {}", name)));
        }

        self.inodes
            .insert(id.key_prefix(), encode(&INodeRef::empty(id))?)
            .map_err(storage_err)?;

        debug!(volume = %name, id = %id, "Created volume");
        Ok(volume)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        match self.volumes.get(name.as_bytes()).map_err(storage_err)? {
            Some(raw) => decode(&raw),
            None => Err(BlockRingError::VolumeNotFound(name.to_string())),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for entry in self.volumes.iter() {
            let (_, raw) = entry.map_err(storage_err)?;
            volumes.push(decode(&raw)?);
        }
        Ok(volumes)
    }

    async fn delete_volume(&self, name: &str, lease: Option<LeaseId>) -> Result<()> {
        let now = now_ms();

        // Lease check and removal commit together
        let result = (&self.volumes, &self.leases, &self.inodes).transaction(
            |(volumes, leases, inodes)| {
                let Some(raw) = volumes.get(name.as_bytes())? else {
                    return Err(ConflictableTransactionError::Abort(
                        BlockRingError::VolumeNotFound(name.to_string()),
                    ));
                };
                let volume: Volume = decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                let key = volume.id.key_prefix();

                if let Some(raw) = leases.get(key)? {
                    let record: LeaseRecord =
                        decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                    if record.is_live(now) && Some(record.lease) != lease {
                        return Err(ConflictableTransactionError::Abort(
                            BlockRingError::AlreadyLocked {
                                volume: name.to_string(),
                                holder: record.lease.0,
                            },
                        ));
                    }
                }

                volumes.remove(name.as_bytes())?;
                leases.remove(&key[..])?;
                inodes.remove(&key[..])?;
                Ok(volume.id)
            },
        );
        let id = committed(result)?;

        // Unreachable once the inode is gone
        let key = id.key_prefix();
        for tree in [&self.snapshots, &self.snapshot_names] {
            for entry in tree.scan_prefix(key).keys() {
                tree.remove(entry.map_err(storage_err)?)
                    .map_err(storage_err)?;
            }
        }

        info!(volume = %name, "Deleted volume");
        Ok(())
    }

    async fn grant_lease(&self) -> Result<LeaseId> {
        Ok(LeaseId(self.next_id()? as i64))
    }

    async fn acquire_lease(&self, volume: VolumeId, lease: LeaseId, ttl: Duration) -> Result<()> {
        let key = volume.key_prefix();
        let next = encode(&LeaseRecord::new(lease, ttl))?;
        let now = now_ms();

        // Commits against the same inode a concurrent delete removes
        let result = (&self.leases, &self.inodes).transaction(|(leases, inodes)| {
            if inodes.get(key)?.is_none() {
                return Err(ConflictableTransactionError::Abort(
                    BlockRingError::VolumeNotFound(volume.to_string()),
                ));
            }
            if let Some(raw) = leases.get(key)? {
                let record: LeaseRecord =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                if record.is_live(now) && record.lease != lease {
                    return Err(ConflictableTransactionError::Abort(
                        BlockRingError::AlreadyLocked {
                            volume: volume.to_string(),
                            holder: record.lease.0,
                        },
                    ));
                }
            }
            leases.insert(&key[..], next.clone())?;
            Ok(())
        });
        committed(result)
    }

    async fn release_lease(&self, volume: VolumeId, lease: LeaseId) -> Result<bool> {
        let key = volume.key_prefix();
        let Some(raw) = self.leases.get(key).map_err(storage_err)? else {
            return Ok(false);
        };
        let record: LeaseRecord = decode(&raw)?;
        if record.lease != lease {
            return Ok(false);
        }

        let swapped = self
            .leases
            .compare_and_swap(key, Some(raw), None as Option<&[u8]>)
            .map_err(storage_err)?;
        Ok(swapped.is_ok())
    }

    async fn lease_holder(&self, volume: VolumeId) -> Result<Option<LeaseId>> {
        Ok(self.live_lease(volume)?.map(|r| r.lease))
    }

    async fn get_inode(&self, volume: VolumeId) -> Result<INodeRef> {
        match self.inodes.get(volume.key_prefix()).map_err(storage_err)? {
            Some(raw) => decode(&raw),
            None => Err(BlockRingError::VolumeNotFound(volume.to_string())),
        }
    }

    async fn set_inode(&self, volume: VolumeId, lease: LeaseId, inode: INodeRef) -> Result<()> {
        let key = volume.key_prefix();
        let encoded = encode(&inode)?;
        let now = now_ms();

        // Lease check and pointer write commit together
        let result = (&self.leases, &self.inodes).transaction(|(leases, inodes)| {
            if inodes.get(key)?.is_none() {
                return Err(ConflictableTransactionError::Abort(
                    BlockRingError::VolumeNotFound(volume.to_string()),
                ));
            }
            let held = match leases.get(key)? {
                Some(raw) => bincode::deserialize::<LeaseRecord>(&raw)
                    .map(|r| r.lease == lease && r.is_live(now))
                    .unwrap_or(false),
                None => false,
            };
            if !held {
                return Err(ConflictableTransactionError::Abort(
                    BlockRingError::NotLocked(volume.to_string()),
                ));
            }
            inodes.insert(&key[..], encoded.clone())?;
            Ok(())
        });
        committed(result)
    }

    async fn add_snapshot(&self, volume: VolumeId, snapshot: Snapshot) -> Result<()> {
        self.require_volume(volume)?;
        let seq = self.next_id()?;

        let claimed = self
            .snapshot_names
            .compare_and_swap(
                snapshot_name_key(volume, &snapshot.name),
                None as Option<&[u8]>,
                Some(&seq.to_be_bytes()[..]),
            )
            .map_err(storage_err)?;
        if claimed.is_err() {
            return Err(BlockRingError::AlreadyExists(format!(
                "snapshot {}",
                snapshot.name
            )));
        }

        let mut key = volume.key_prefix().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        self.snapshots
            .insert(key, encode(&snapshot)?)
            .map_err(storage_err)?;
        Ok(())
    }

    async fn snapshots(&self, volume: VolumeId) -> Result<Vec<Snapshot>> {
        self.require_volume(volume)?;
        let mut list = Vec::new();
        for entry in self.snapshots.scan_prefix(volume.key_prefix()) {
            let (_, raw) = entry.map_err(storage_err)?;
            list.push(decode(&raw)?);
        }
        Ok(list)
    }

    async fn remove_snapshot(&self, volume: VolumeId, name: &str) -> Result<()> {
        self.require_volume(volume)?;
        let Some(seq) = self
            .snapshot_names
            .remove(snapshot_name_key(volume, name))
            .map_err(storage_err)?
        else {
            return Err(BlockRingError::SnapshotNotFound(name.to_string()));
        };

        let mut key = volume.key_prefix().to_vec();
        key.extend_from_slice(&seq);
        self.snapshots.remove(key).map_err(storage_err)?;
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        for tree in [
            &self.volumes,
            &self.leases,
            &self.inodes,
            &self.snapshots,
            &self.snapshot_names,
        ] {
            tree.clear().map_err(storage_err)?;
        }
        info!("Wiped metadata");
        Ok(())
    }
}
