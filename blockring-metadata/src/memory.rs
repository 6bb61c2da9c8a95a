//! In-memory metadata backend
//!
//! Every operation runs under one lock, so the backend is trivially
//! linearizable. Used for tests and single-process deployments.

use crate::backend::{MetadataBackend, MetadataKind};
use crate::models::{now_ms, LeaseId, LeaseRecord, Snapshot};
use async_trait::async_trait;
use blockring_core::{BlockRingError, GlobalMetadata, INodeRef, Result, Volume, VolumeId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct State {
    global: GlobalMetadata,
    volumes: BTreeMap<String, Volume>,
    leases: HashMap<VolumeId, LeaseRecord>,
    inodes: HashMap<VolumeId, INodeRef>,
    snapshots: HashMap<VolumeId, Vec<Snapshot>>,
    next_volume: u64,
    next_lease: i64,
}

impl State {
    fn live_holder(&self, volume: VolumeId) -> Option<LeaseId> {
        self.leases
            .get(&volume)
            .filter(|r| r.is_live(now_ms()))
            .map(|r| r.lease)
    }

    fn volume_exists(&self, volume: VolumeId) -> Result<()> {
        if self.inodes.contains_key(&volume) {
            Ok(())
        } else {
            Err(BlockRingError::VolumeNotFound(volume.to_string()))
        }
    }
}

/// In-memory (`temp`) metadata backend
#[derive(Default)]
pub struct TempMetadata {
    state: Mutex<State>,
}

impl TempMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataBackend for TempMetadata {
    fn kind(&self) -> MetadataKind {
        MetadataKind::Temp
    }

    async fn global_metadata(&self) -> Result<GlobalMetadata> {
        Ok(self.state.lock().global)
    }

    async fn set_global_metadata(&self, global: GlobalMetadata) -> Result<()> {
        self.state.lock().global = global;
        Ok(())
    }

    async fn create_volume(&self, name: &str, block_size: u64) -> Result<Volume> {
        let mut state = self.state.lock();
        if state.volumes.contains_key(name) {
            return Err(BlockRingError::AlreadyExists(format!("volume {}", name)));
        }

        state.next_volume += 1;
        let id = VolumeId(state.next_volume);
        let volume = Volume::block(name, id).with_block_size(block_size);
        state.volumes.insert(name.to_string(), volume.clone());
        state.inodes.insert(id, INodeRef::empty(id));

        debug!(volume = %name, id = %id, "Created volume");
        Ok(volume)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        self.state
            .lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| BlockRingError::VolumeNotFound(name.to_string()))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.state.lock().volumes.values().cloned().collect())
    }

    async fn delete_volume(&self, name: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state.lock();
        let id = state
            .volumes
            .get(name)
            .map(|v| v.id)
            .ok_or_else(|| BlockRingError::VolumeNotFound(name.to_string()))?;

        if let Some(holder) = state.live_holder(id) {
            if Some(holder) != lease {
                return Err(BlockRingError::AlreadyLocked {
                    volume: name.to_string(),
                    holder: holder.0,
                });
            }
        }

        state.volumes.remove(name);
        state.leases.remove(&id);
        state.inodes.remove(&id);
        state.snapshots.remove(&id);
        Ok(())
    }

    async fn grant_lease(&self) -> Result<LeaseId> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        Ok(LeaseId(state.next_lease))
    }

    async fn acquire_lease(&self, volume: VolumeId, lease: LeaseId, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.volume_exists(volume)?;

        match state.live_holder(volume) {
            Some(holder) if holder != lease => Err(BlockRingError::AlreadyLocked {
                volume: volume.to_string(),
                holder: holder.0,
            }),
            _ => {
                state.leases.insert(volume, LeaseRecord::new(lease, ttl));
                Ok(())
            }
        }
    }

    async fn release_lease(&self, volume: VolumeId, lease: LeaseId) -> Result<bool> {
        let mut state = self.state.lock();
        match state.leases.get(&volume) {
            Some(record) if record.lease == lease => {
                state.leases.remove(&volume);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lease_holder(&self, volume: VolumeId) -> Result<Option<LeaseId>> {
        Ok(self.state.lock().live_holder(volume))
    }

    async fn get_inode(&self, volume: VolumeId) -> Result<INodeRef> {
        self.state
            .lock()
            .inodes
            .get(&volume)
            .copied()
            .ok_or_else(|| BlockRingError::VolumeNotFound(volume.to_string()))
    }

    async fn set_inode(&self, volume: VolumeId, lease: LeaseId, inode: INodeRef) -> Result<()> {
        let mut state = self.state.lock();
        state.volume_exists(volume)?;
        if state.live_holder(volume) != Some(lease) {
            return Err(BlockRingError::NotLocked(volume.to_string()));
        }
        state.inodes.insert(volume, inode);
        Ok(())
    }

    async fn add_snapshot(&self, volume: VolumeId, snapshot: Snapshot) -> Result<()> {
        let mut state = self.state.lock();
        state.volume_exists(volume)?;

        let list = state.snapshots.entry(volume).or_default();
        if list.iter().any(|s| s.name == snapshot.name) {
            return Err(BlockRingError::AlreadyExists(format!(
                "snapshot {}",
                snapshot.name
            )));
        }
        list.push(snapshot);
        Ok(())
    }

    async fn snapshots(&self, volume: VolumeId) -> Result<Vec<Snapshot>> {
        let state = self.state.lock();
        state.volume_exists(volume)?;
        Ok(state.snapshots.get(&volume).cloned().unwrap_or_default())
    }

    async fn remove_snapshot(&self, volume: VolumeId, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.volume_exists(volume)?;
        let list = state
            .snapshots
            .get_mut(&volume)
            .ok_or_else(|| BlockRingError::SnapshotNotFound(name.to_string()))?;
        match list.iter().position(|s| s.name == name) {
            Some(pos) => {
                list.remove(pos);
                Ok(())
            }
            None => Err(BlockRingError::SnapshotNotFound(name.to_string())),
        }
    }

    async fn wipe(&self) -> Result<()> {
        let mut state = self.state.lock();
        let global = state.global;
        *state = State {
            global,
            ..Default::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_volume_ids_are_unique() {
        let md = TempMetadata::new();
        let a = md.create_volume("a", 4096).await.unwrap();
        let b = md.create_volume("b", 4096).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(md.get_inode(a.id).await.unwrap(), INodeRef::empty(a.id));

        let err = md.create_volume("a", 4096).await.unwrap_err();
        assert!(matches!(err, BlockRingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_expired_lease_is_absent() {
        let md = TempMetadata::new();
        let vol = md.create_volume("a", 4096).await.unwrap();
        let first = md.grant_lease().await.unwrap();
        let second = md.grant_lease().await.unwrap();

        md.acquire_lease(vol.id, first, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(md.lease_holder(vol.id).await.unwrap(), None);
        md.acquire_lease(vol.id, second, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(md.lease_holder(vol.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_wipe_keeps_global() {
        let md = TempMetadata::new();
        let global = GlobalMetadata {
            block_size: 4096,
            replication: 3,
        };
        md.set_global_metadata(global).await.unwrap();
        md.create_volume("a", 4096).await.unwrap();

        md.wipe().await.unwrap();
        assert!(md.list_volumes().await.unwrap().is_empty());
        assert_eq!(md.global_metadata().await.unwrap(), global);
    }

    #[tokio::test]
    async fn test_remove_snapshot_of_unknown_volume() {
        let md = TempMetadata::new();
        let vol = md.create_volume("a", 4096).await.unwrap();

        let err = md.remove_snapshot(VolumeId(99), "snap").await.unwrap_err();
        assert!(matches!(err, BlockRingError::VolumeNotFound(_)));
        let err = md.remove_snapshot(vol.id, "snap").await.unwrap_err();
        assert!(matches!(err, BlockRingError::SnapshotNotFound(_)));

        md.delete_volume("a", None).await.unwrap();
        let err = md.remove_snapshot(vol.id, "snap").await.unwrap_err();
        assert!(matches!(err, BlockRingError::VolumeNotFound(_)));
        assert!(md.state.lock().snapshots.is_empty());
    }
}
