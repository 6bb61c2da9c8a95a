//! Block and inode references
//!
//! A block is addressed by the volume it belongs to, the inode that wrote it,
//! and its index within that inode. References are plain values: they are
//! `Copy`, compare by value, and are never mutated after creation.

use crate::error::{BlockRingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded length of a [`BlockRef`] in bytes
pub const BLOCK_REF_LEN: usize = 24;

/// Volume identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

impl VolumeId {
    /// Big-endian key prefix shared by every block of this volume
    pub fn key_prefix(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a volume's root inode
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct INodeRef {
    pub volume: VolumeId,
    pub inode: u64,
}

impl INodeRef {
    pub fn new(volume: VolumeId, inode: u64) -> Self {
        Self { volume, inode }
    }

    /// The empty root of a freshly created volume
    pub fn empty(volume: VolumeId) -> Self {
        Self { volume, inode: 0 }
    }

    /// Derive the reference of one block written by this inode
    pub fn block(&self, index: u64) -> BlockRef {
        BlockRef {
            volume: self.volume,
            inode: self.inode,
            index,
        }
    }
}

impl fmt::Debug for INodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INodeRef({}:{})", self.volume.0, self.inode)
    }
}

impl fmt::Display for INodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume.0, self.inode)
    }
}

/// Immutable identifier of one stored block
///
/// Ordering is `(volume, inode, index)`, which matches the byte ordering of
/// [`BlockRef::to_bytes`], so all blocks of a volume are contiguous in any
/// ordered key space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub volume: VolumeId,
    pub inode: u64,
    pub index: u64,
}

impl BlockRef {
    pub fn new(volume: VolumeId, inode: u64, index: u64) -> Self {
        Self {
            volume,
            inode,
            index,
        }
    }

    /// The inode this block belongs to
    pub fn inode_ref(&self) -> INodeRef {
        INodeRef::new(self.volume, self.inode)
    }

    /// Fixed-width big-endian encoding used as a storage key
    pub fn to_bytes(&self) -> [u8; BLOCK_REF_LEN] {
        let mut out = [0u8; BLOCK_REF_LEN];
        out[0..8].copy_from_slice(&self.volume.0.to_be_bytes());
        out[8..16].copy_from_slice(&self.inode.to_be_bytes());
        out[16..24].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    /// Decode from [`BlockRef::to_bytes`] output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOCK_REF_LEN {
            return Err(BlockRingError::Serialization(format!(
                "Invalid block ref length: expected {}, got {}",
                BLOCK_REF_LEN,
                bytes.len()
            )));
        }
        let word = |i: usize| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&bytes[i..i + 8]);
            u64::from_be_bytes(arr)
        };
        Ok(Self {
            volume: VolumeId(word(0)),
            inode: word(8),
            index: word(16),
        })
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockRef({}:{}:{})",
            self.volume.0, self.inode, self.index
        )
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.volume.0, self.inode, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_block_ref_bytes() {
        let r = BlockRef::new(VolumeId(7), 3, 5);
        let bytes = r.to_bytes();
        assert_eq!(&bytes[0..8], &7u64.to_be_bytes());
        assert_eq!(BlockRef::from_bytes(&bytes).unwrap(), r);
    }

    #[test]
    fn test_block_ref_bad_length() {
        let err = BlockRef::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, BlockRingError::Serialization(_)));
    }

    #[test]
    fn test_inode_block() {
        let inode = INodeRef::new(VolumeId(1), 9);
        let block = inode.block(4);
        assert_eq!(block, BlockRef::new(VolumeId(1), 9, 4));
        assert_eq!(block.inode_ref(), inode);
    }

    #[test]
    fn test_display() {
        let r = BlockRef::new(VolumeId(1), 2, 3);
        assert_eq!(r.to_string(), "1:2:3");
        assert_eq!(format!("{:?}", r), "BlockRef(1:2:3)");
    }

    proptest! {
        #[test]
        fn key_order_matches_value_order(
            a in (0u64..4, 0u64..1000, any::<u64>()),
            b in (0u64..4, 0u64..1000, any::<u64>()),
        ) {
            let ra = BlockRef::new(VolumeId(a.0), a.1, a.2);
            let rb = BlockRef::new(VolumeId(b.0), b.1, b.2);
            prop_assert_eq!(ra.cmp(&rb), ra.to_bytes().cmp(&rb.to_bytes()));
        }
    }
}
