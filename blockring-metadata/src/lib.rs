//! blockring Metadata Service
//!
//! Per-volume metadata: the volume registry, lease locks, the root inode
//! pointer and snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 BlockVolume                   │
//! │      lock / unlock / sync_inode / snapshots   │
//! └──────────────────────┬───────────────────────┘
//!                        │ Arc<dyn MetadataBackend>
//!          ┌─────────────┴─────────────┐
//!   ┌──────┴───────┐            ┌──────┴───────┐
//!   │ TempMetadata │            │ SledMetadata │
//!   │ (in-memory)  │            │  (sled, CAS) │
//!   └──────────────┘            └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use blockring_metadata::{open_backend, BlockVolume, MetadataConfig};
//!
//! let backend = open_backend(&MetadataConfig::temp())?;
//! let vol = BlockVolume::create_block_volume(backend.clone(), "data", 512 * 1024).await?;
//! vol.lock(backend.grant_lease().await?).await?;
//! vol.save_snapshot("daily").await?;
//! ```

pub mod backend;
pub mod block;
pub mod memory;
pub mod models;
pub mod sled_store;

pub use backend::{open_backend, MetadataBackend, MetadataConfig, MetadataKind, DEFAULT_LEASE_TTL};
pub use block::BlockVolume;
pub use memory::TempMetadata;
pub use models::{LeaseId, Snapshot};
pub use sled_store::SledMetadata;
