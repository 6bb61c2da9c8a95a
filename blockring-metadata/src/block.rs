//! Volume coordinator for block volumes
//!
//! `BlockVolume` is the per-volume handle a writer session uses. It owns the
//! session's lease and routes every mutation of the root inode pointer
//! through it. Reads never need the lock.

use crate::backend::{MetadataBackend, DEFAULT_LEASE_TTL};
use crate::models::{LeaseId, Snapshot};
use blockring_core::{BlockRingError, INodeRef, Result, Volume, VolumeId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Coordinator for one block volume
pub struct BlockVolume {
    backend: Arc<dyn MetadataBackend>,
    volume: Volume,
    lease: Mutex<Option<LeaseId>>,
    lease_ttl: Duration,
}

impl std::fmt::Debug for BlockVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockVolume")
            .field("volume", &self.volume)
            .field("lease", &*self.lease.lock())
            .finish()
    }
}

impl BlockVolume {
    /// Register a new block volume and return its coordinator
    #[instrument(skip(backend))]
    pub async fn create_block_volume(
        backend: Arc<dyn MetadataBackend>,
        name: &str,
        block_size: u64,
    ) -> Result<Self> {
        let volume = backend.create_volume(name, block_size).await?;
        info!(volume = %name, id = %volume.id, block_size, "Created block volume");
        Ok(Self::new(backend, volume))
    }

    /// Coordinator for an existing volume
    pub async fn open(backend: Arc<dyn MetadataBackend>, name: &str) -> Result<Self> {
        let volume = backend.get_volume(name).await?;
        Ok(Self::new(backend, volume))
    }

    fn new(backend: Arc<dyn MetadataBackend>, volume: Volume) -> Self {
        Self {
            backend,
            volume,
            lease: Mutex::new(None),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Set the TTL used when taking the lock
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn id(&self) -> VolumeId {
        self.volume.id
    }

    /// Lease this handle currently holds
    pub fn lease(&self) -> Option<LeaseId> {
        *self.lease.lock()
    }

    /// Take the volume lock for `lease`; calling again with the same lease
    /// refreshes its TTL.
    #[instrument(skip(self), fields(volume = %self.volume.name))]
    pub async fn lock(&self, lease: LeaseId) -> Result<()> {
        self.backend
            .acquire_lease(self.volume.id, lease, self.lease_ttl)
            .await?;
        *self.lease.lock() = Some(lease);
        debug!(lease = %lease, "Volume locked");
        Ok(())
    }

    /// Release this handle's lease. A lease that already expired and was
    /// taken by someone else is left alone.
    #[instrument(skip(self), fields(volume = %self.volume.name))]
    pub async fn unlock(&self) -> Result<()> {
        let lease = self
            .lease
            .lock()
            .take()
            .ok_or_else(|| BlockRingError::NotLocked(self.volume.name.clone()))?;

        if !self.backend.release_lease(self.volume.id, lease).await? {
            debug!(lease = %lease, "Lease no longer held at unlock");
        }
        Ok(())
    }

    /// Current root pointer
    pub async fn get_inode(&self) -> Result<INodeRef> {
        self.backend.get_inode(self.volume.id).await
    }

    /// Replace the root pointer; requires the live lease
    #[instrument(skip(self), fields(volume = %self.volume.name))]
    pub async fn sync_inode(&self, inode: INodeRef) -> Result<()> {
        let lease = self
            .lease()
            .ok_or_else(|| BlockRingError::NotLocked(self.volume.name.clone()))?;
        self.backend.set_inode(self.volume.id, lease, inode).await
    }

    /// Remove the volume. Fails `AlreadyLocked` if another session holds it.
    #[instrument(skip(self), fields(volume = %self.volume.name))]
    pub async fn delete_volume(&self) -> Result<()> {
        self.backend
            .delete_volume(&self.volume.name, self.lease())
            .await?;
        self.lease.lock().take();
        Ok(())
    }

    /// Capture the current root pointer under `name`
    #[instrument(skip(self), fields(volume = %self.volume.name))]
    pub async fn save_snapshot(&self, name: &str) -> Result<Snapshot> {
        let inode = self.get_inode().await?;
        let snapshot = Snapshot::new(name, inode);
        self.backend
            .add_snapshot(self.volume.id, snapshot.clone())
            .await?;
        info!(snapshot = %name, inode = %inode, "Saved snapshot");
        Ok(snapshot)
    }

    /// Snapshots in creation order
    pub async fn get_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.backend.snapshots(self.volume.id).await
    }

    pub async fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.backend.remove_snapshot(self.volume.id, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TempMetadata;

    fn backend() -> Arc<dyn MetadataBackend> {
        Arc::new(TempMetadata::new())
    }

    #[tokio::test]
    async fn test_create_clash() {
        let md = backend();
        BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();
        let err = BlockVolume::create_block_volume(md, "vol", 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockRingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let md = backend();
        let a = BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();
        let b = BlockVolume::open(md.clone(), "vol").await.unwrap();
        let la = md.grant_lease().await.unwrap();
        let lb = md.grant_lease().await.unwrap();

        a.lock(la).await.unwrap();
        a.lock(la).await.unwrap();
        let err = b.lock(lb).await.unwrap_err();
        assert!(matches!(err, BlockRingError::AlreadyLocked { .. }));

        a.unlock().await.unwrap();
        b.lock(lb).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_inode_needs_lock() {
        let md = backend();
        let vol = BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();
        let root = INodeRef::new(vol.id(), 3);

        assert!(matches!(
            vol.sync_inode(root).await,
            Err(BlockRingError::NotLocked(_))
        ));

        vol.lock(md.grant_lease().await.unwrap()).await.unwrap();
        vol.sync_inode(root).await.unwrap();
        assert_eq!(vol.get_inode().await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let vol = BlockVolume::create_block_volume(backend(), "vol", 4096)
            .await
            .unwrap();
        assert!(matches!(
            vol.unlock().await,
            Err(BlockRingError::NotLocked(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_locked_by_other() {
        let md = backend();
        let owner = BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();
        let other = BlockVolume::open(md.clone(), "vol").await.unwrap();
        owner.lock(md.grant_lease().await.unwrap()).await.unwrap();

        assert!(matches!(
            other.delete_volume().await,
            Err(BlockRingError::AlreadyLocked { .. })
        ));
        owner.delete_volume().await.unwrap();
        assert!(md.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_daily_twice() {
        let md = backend();
        let vol = BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();

        vol.save_snapshot("daily").await.unwrap();
        let err = vol.save_snapshot("daily").await.unwrap_err();
        assert!(matches!(err, BlockRingError::AlreadyExists(_)));

        let snaps = vol.get_snapshots().await.unwrap();
        assert_eq!(snaps.iter().filter(|s| s.name == "daily").count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_captures_inode() {
        let md = backend();
        let vol = BlockVolume::create_block_volume(md.clone(), "vol", 4096)
            .await
            .unwrap();
        vol.lock(md.grant_lease().await.unwrap()).await.unwrap();

        vol.save_snapshot("before").await.unwrap();
        vol.sync_inode(INodeRef::new(vol.id(), 5)).await.unwrap();
        vol.save_snapshot("after").await.unwrap();

        let snaps = vol.get_snapshots().await.unwrap();
        assert_eq!(snaps[0].inode, INodeRef::empty(vol.id()));
        assert_eq!(snaps[1].inode, INodeRef::new(vol.id(), 5));
        assert!(snaps[0].when <= snaps[1].when);

        vol.delete_snapshot("before").await.unwrap();
        assert!(matches!(
            vol.delete_snapshot("before").await,
            Err(BlockRingError::SnapshotNotFound(_))
        ));
    }
}
