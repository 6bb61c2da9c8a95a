//! Metadata backend contract
//!
//! Everything the volume coordinator needs from a metadata service: the
//! volume registry, lease locks with a TTL, the root inode pointer and the
//! snapshot list. Implementations must be linearizable per lease holder.

use crate::memory::TempMetadata;
use crate::models::{LeaseId, Snapshot};
use crate::sled_store::SledMetadata;
use async_trait::async_trait;
use blockring_core::{BlockRingError, GlobalMetadata, INodeRef, Result, Volume, VolumeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default lease time-to-live
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Which configured kind this backend is
    fn kind(&self) -> MetadataKind;

    /// Cluster-wide settings
    async fn global_metadata(&self) -> Result<GlobalMetadata>;

    async fn set_global_metadata(&self, global: GlobalMetadata) -> Result<()>;

    /// Register a new volume under a freshly allocated id; the root inode
    /// starts out empty. Fails `AlreadyExists` on a name clash.
    async fn create_volume(&self, name: &str, block_size: u64) -> Result<Volume>;

    async fn get_volume(&self, name: &str) -> Result<Volume>;

    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    /// Remove a volume with its pointer, snapshots and lease. Fails
    /// `AlreadyLocked` if a live lease other than `lease` holds it.
    async fn delete_volume(&self, name: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Hand out a new lease id
    async fn grant_lease(&self) -> Result<LeaseId>;

    /// Take or refresh the lock on a volume
    async fn acquire_lease(&self, volume: VolumeId, lease: LeaseId, ttl: Duration) -> Result<()>;

    /// Drop the lock if `lease` holds it; returns whether anything was released
    async fn release_lease(&self, volume: VolumeId, lease: LeaseId) -> Result<bool>;

    /// Current live holder, if any
    async fn lease_holder(&self, volume: VolumeId) -> Result<Option<LeaseId>>;

    async fn get_inode(&self, volume: VolumeId) -> Result<INodeRef>;

    /// Replace the root pointer. Fails `NotLocked` unless `lease` is live.
    async fn set_inode(&self, volume: VolumeId, lease: LeaseId, inode: INodeRef) -> Result<()>;

    /// Append a snapshot. Fails `AlreadyExists` if the name is taken.
    async fn add_snapshot(&self, volume: VolumeId, snapshot: Snapshot) -> Result<()>;

    /// Snapshots in creation order
    async fn snapshots(&self, volume: VolumeId) -> Result<Vec<Snapshot>>;

    async fn remove_snapshot(&self, volume: VolumeId, name: &str) -> Result<()>;

    /// Remove all metadata
    async fn wipe(&self) -> Result<()>;
}

/// Metadata backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    /// In-memory, single process
    #[default]
    Temp,
    /// Local sled database
    Sled,
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temp => write!(f, "temp"),
            Self::Sled => write!(f, "sled"),
        }
    }
}

impl std::str::FromStr for MetadataKind {
    type Err = BlockRingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "temp" => Ok(Self::Temp),
            "sled" => Ok(Self::Sled),
            other => Err(BlockRingError::Configuration(format!(
                "unknown metadata kind: {}",
                other
            ))),
        }
    }
}

/// Metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub kind: MetadataKind,

    /// Database directory, used by `sled`
    pub path: PathBuf,

    /// Lease time-to-live in seconds
    pub lease_ttl_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            kind: MetadataKind::Temp,
            path: PathBuf::from("./blockring_data/metadata"),
            lease_ttl_secs: DEFAULT_LEASE_TTL.as_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn temp() -> Self {
        Self::default()
    }

    pub fn sled(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MetadataKind::Sled,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Open the backend selected by `config.kind`
pub fn open_backend(config: &MetadataConfig) -> Result<Arc<dyn MetadataBackend>> {
    match config.kind {
        MetadataKind::Temp => Ok(Arc::new(TempMetadata::new())),
        MetadataKind::Sled => Ok(Arc::new(SledMetadata::open(&config.path)?)),
    }
}
