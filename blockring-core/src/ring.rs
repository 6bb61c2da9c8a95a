//! Block placement
//!
//! A [`Ring`] maps a block to the ordered list of peers authorized to hold it.
//! Rings are immutable: a topology change produces a new ring with a higher
//! version and the old value stays usable for whoever still holds it.
//! [`SharedRing`] is the per-process holder of the current ring.

use crate::block::BlockRef;
use crate::error::{BlockRingError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Peer identifier as used by rings
pub type PeerId = String;

/// Versioned placement oracle
pub trait Ring: Send + Sync + fmt::Debug {
    /// Monotonically increasing topology version
    fn version(&self) -> u64;

    /// Ordered authorized holders for a block; deterministic for a fixed version
    fn lookup(&self, block: &BlockRef) -> Result<Vec<PeerId>>;

    /// All peers known to this ring
    fn members(&self) -> Vec<PeerId>;
}

/// Source of the current ring and the local node's identity
pub trait Topology: Send + Sync {
    /// Snapshot of the current ring
    fn ring(&self) -> Arc<dyn Ring>;

    /// Peer id of the local node
    fn local_peer(&self) -> &str;
}

// =============================================================================
// STATIC RING
// =============================================================================

/// Ring with an explicit placement table
///
/// Blocks without an entry map to the default peer list.
#[derive(Debug, Clone)]
pub struct StaticRing {
    version: u64,
    default_peers: Vec<PeerId>,
    placements: HashMap<BlockRef, Vec<PeerId>>,
}

impl StaticRing {
    pub fn new(version: u64, default_peers: Vec<PeerId>) -> Self {
        Self {
            version,
            default_peers,
            placements: HashMap::new(),
        }
    }

    /// Pin a block to a peer list
    pub fn with_block(mut self, block: BlockRef, peers: Vec<PeerId>) -> Self {
        self.placements.insert(block, peers);
        self
    }
}

impl Ring for StaticRing {
    fn version(&self) -> u64 {
        self.version
    }

    fn lookup(&self, block: &BlockRef) -> Result<Vec<PeerId>> {
        let peers = self.placements.get(block).unwrap_or(&self.default_peers);
        if peers.is_empty() {
            return Err(BlockRingError::Ring(format!("no peers for block {}", block)));
        }
        Ok(peers.clone())
    }

    fn members(&self) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self
            .default_peers
            .iter()
            .chain(self.placements.values().flatten())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

// =============================================================================
// HASH RING
// =============================================================================

/// Default virtual nodes per peer
pub const DEFAULT_VNODES: u32 = 64;

/// Consistent-hash ring with virtual nodes
#[derive(Clone)]
pub struct HashRing {
    version: u64,
    replication: usize,
    vnodes: u32,
    peers: Vec<PeerId>,
    /// Sorted (point, peer index) pairs
    points: Vec<(u64, usize)>,
}

impl HashRing {
    /// Build a ring over `peers` returning `replication` holders per block
    pub fn new(version: u64, peers: Vec<PeerId>, replication: usize) -> Self {
        Self::with_vnodes(version, peers, replication, DEFAULT_VNODES)
    }

    pub fn with_vnodes(version: u64, mut peers: Vec<PeerId>, replication: usize, vnodes: u32) -> Self {
        peers.sort();
        peers.dedup();

        let mut points = Vec::with_capacity(peers.len() * vnodes as usize);
        for (idx, peer) in peers.iter().enumerate() {
            for v in 0..vnodes {
                points.push((hash64(format!("{}:{}", peer, v).as_bytes()), idx));
            }
        }
        points.sort_unstable();

        Self {
            version,
            replication: replication.max(1),
            vnodes,
            peers,
            points,
        }
    }

    /// Produce the next version of this ring with a new membership
    pub fn with_peers(&self, peers: Vec<PeerId>) -> Self {
        Self::with_vnodes(self.version + 1, peers, self.replication, self.vnodes)
    }

    pub fn replication(&self) -> usize {
        self.replication
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRing")
            .field("version", &self.version)
            .field("replication", &self.replication)
            .field("peers", &self.peers)
            .finish()
    }
}

impl Ring for HashRing {
    fn version(&self) -> u64 {
        self.version
    }

    fn lookup(&self, block: &BlockRef) -> Result<Vec<PeerId>> {
        if self.points.is_empty() {
            return Err(BlockRingError::Ring("ring has no members".to_string()));
        }

        let key = hash64(&block.to_bytes());
        let start = self.points.partition_point(|(point, _)| *point < key);
        let wanted = self.replication.min(self.peers.len());

        let mut out: Vec<PeerId> = Vec::with_capacity(wanted);
        for i in 0..self.points.len() {
            let (_, idx) = self.points[(start + i) % self.points.len()];
            let peer = &self.peers[idx];
            if !out.contains(peer) {
                out.push(peer.clone());
                if out.len() == wanted {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn members(&self) -> Vec<PeerId> {
        self.peers.clone()
    }
}

fn hash64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(arr)
}

// =============================================================================
// SHARED RING
// =============================================================================

/// Holder of the current ring for one process
pub struct SharedRing {
    local_peer: PeerId,
    current: RwLock<Arc<dyn Ring>>,
}

impl SharedRing {
    pub fn new(local_peer: impl Into<PeerId>, ring: Arc<dyn Ring>) -> Self {
        Self {
            local_peer: local_peer.into(),
            current: RwLock::new(ring),
        }
    }

    /// Install a new ring; its version must be strictly greater
    pub fn set_ring(&self, ring: Arc<dyn Ring>) -> Result<()> {
        let mut current = self.current.write();
        if ring.version() <= current.version() {
            return Err(BlockRingError::Ring(format!(
                "ring version {} does not advance current version {}",
                ring.version(),
                current.version()
            )));
        }
        info!(
            from = current.version(),
            to = ring.version(),
            "Ring version advanced"
        );
        *current = ring;
        Ok(())
    }
}

impl Topology for SharedRing {
    fn ring(&self) -> Arc<dyn Ring> {
        self.current.read().clone()
    }

    fn local_peer(&self) -> &str {
        &self.local_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VolumeId;

    fn peers(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_static_ring_lookup() {
        let pinned = BlockRef::new(VolumeId(1), 1, 5);
        let ring = StaticRing::new(1, peers(&["a", "b"])).with_block(pinned, peers(&["c"]));

        assert_eq!(ring.lookup(&pinned).unwrap(), peers(&["c"]));
        assert_eq!(
            ring.lookup(&BlockRef::new(VolumeId(1), 1, 6)).unwrap(),
            peers(&["a", "b"])
        );
        assert_eq!(ring.members(), peers(&["a", "b", "c"]));
    }

    #[test]
    fn test_static_ring_empty() {
        let ring = StaticRing::new(1, Vec::new());
        assert!(ring.lookup(&BlockRef::new(VolumeId(1), 0, 0)).is_err());
    }

    #[test]
    fn test_hash_ring_deterministic() {
        let ring = HashRing::new(1, peers(&["n1", "n2", "n3", "n4"]), 2);
        for i in 0..100 {
            let block = BlockRef::new(VolumeId(2), 1, i);
            let a = ring.lookup(&block).unwrap();
            let b = ring.lookup(&block).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 2);
            assert_ne!(a[0], a[1]);
        }
    }

    #[test]
    fn test_hash_ring_replication_capped() {
        let ring = HashRing::new(1, peers(&["solo"]), 3);
        let holders = ring.lookup(&BlockRef::new(VolumeId(1), 1, 1)).unwrap();
        assert_eq!(holders, peers(&["solo"]));
    }

    #[test]
    fn test_hash_ring_spreads_load() {
        let ring = HashRing::new(1, peers(&["n1", "n2", "n3"]), 1);
        let mut counts: HashMap<PeerId, usize> = HashMap::new();
        for i in 0..3000 {
            let owner = ring.lookup(&BlockRef::new(VolumeId(1), 1, i)).unwrap();
            *counts.entry(owner[0].clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c > 500));
    }

    #[test]
    fn test_hash_ring_with_peers_bumps_version() {
        let ring = HashRing::new(4, peers(&["n1", "n2"]), 2);
        let next = ring.with_peers(peers(&["n1", "n2", "n3"]));
        assert_eq!(next.version(), 5);
        assert_eq!(next.members().len(), 3);
    }

    #[test]
    fn test_shared_ring_rejects_old_version() {
        let shared = SharedRing::new("n1", Arc::new(StaticRing::new(2, peers(&["n1"]))));
        assert!(shared
            .set_ring(Arc::new(StaticRing::new(2, peers(&["n2"]))))
            .is_err());
        shared
            .set_ring(Arc::new(StaticRing::new(3, peers(&["n2"]))))
            .unwrap();
        assert_eq!(shared.ring().version(), 3);
        assert_eq!(shared.local_peer(), "n1");
    }
}
