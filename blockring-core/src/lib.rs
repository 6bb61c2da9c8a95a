//! blockring Core Library
//!
//! Core abstractions shared by every blockring crate:
//! - Block, inode, and volume identifiers
//! - Volume descriptors and cluster-wide settings
//! - Versioned block placement (`Ring`)
//! - Common error handling

pub mod block;
pub mod error;
pub mod ring;
pub mod volume;

pub use block::{BlockRef, INodeRef, VolumeId, BLOCK_REF_LEN};
pub use error::{BlockRingError, Result};
pub use ring::{HashRing, PeerId, Ring, SharedRing, StaticRing, Topology};
pub use volume::{GlobalMetadata, Volume, VolumeKind};

/// Default block size
pub const DEFAULT_BLOCK_SIZE: u64 = 512 * 1024; // 512 KB

/// Default number of authorized holders per block
pub const DEFAULT_REPLICATION: usize = 2;

/// Well-known port for block distribution traffic
pub const DEFAULT_PORT: u16 = 40000;
