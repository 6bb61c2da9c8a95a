//! Rebalancer
//!
//! Moves local blocks to the peers the ring authorizes to hold them, one
//! bounded batch per [`Rebalancer::tick`]. A pass over a volume is pinned to
//! the ring version current when the pass started; if the ring moves during
//! the pass, the pass is abandoned and restarted under the new version.
//!
//! A pass only runs while the lease seen by [`Rebalancer::prep_volume`]
//! still holds the volume.
//!
//! The rebalancer never deletes. A block confirmed on an authorized holder is
//! only marked reclaimable in the [`GarbageCollector`].

use crate::gc::GarbageCollector;
use crate::metrics;
use crate::sender::CheckAndSender;
use blockring_core::{BlockRef, BlockRingError, Result, Ring, Topology, VolumeId};
use blockring_metadata::{LeaseId, MetadataBackend};
use blockring_storage::{BlockIterator, BlockStore};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Refs looked at this tick
    pub examined: usize,
    /// Refs the local node is authorized to hold
    pub kept: usize,
    /// Refs sent to a peer
    pub transferred: usize,
    /// Refs a peer already held
    pub already_present: usize,
    /// Refs left for the next tick after peer failures
    pub deferred: usize,
    /// Ring moved during the pass; the next tick starts over
    pub restart_required: bool,
    /// The pass reached the end of the volume
    pub exhausted: bool,
    /// Ring version the tick's decisions were made under
    pub version: u64,
}

impl TickReport {
    /// Whether the caller should tick again without waiting
    pub fn has_more(&self) -> bool {
        !self.exhausted && !self.restart_required && self.deferred == 0 && self.examined > 0
    }
}

/// What happened to a single ref
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Kept,
    Transferred,
    AlreadyPresent,
    Deferred,
    /// Gone from the local store since the iterator listed it
    Vanished,
}

/// One pass over a volume, pinned to a ring
struct Session {
    ring: Arc<dyn Ring>,
    blocks: BlockIterator,
}

/// The parts of a rebalancer a single placement needs
#[derive(Clone)]
struct Mover {
    store: Arc<dyn BlockStore>,
    sender: Arc<dyn CheckAndSender>,
    gc: Arc<dyn GarbageCollector>,
}

impl Mover {
    /// Decide and act on one ref. Only local store failures are errors.
    async fn place(&self, ring: &dyn Ring, local: &str, block: BlockRef) -> Result<Placement> {
        let holders = match ring.lookup(&block) {
            Ok(holders) => holders,
            Err(e) => {
                warn!(block = %block, error = %e, "Ring lookup failed, deferring");
                return Ok(Placement::Deferred);
            }
        };

        if holders.iter().any(|peer| peer == local) {
            debug!(block = %block, "Authorized locally");
            return Ok(Placement::Kept);
        }

        let mut data: Option<Bytes> = None;
        for peer in &holders {
            match self.sender.check(peer, std::slice::from_ref(&block)).await {
                Ok(valid) if valid.first().copied().unwrap_or(false) => {
                    debug!(block = %block, peer = %peer, "Peer already holds block");
                    self.gc.mark_reclaimable(block);
                    return Ok(Placement::AlreadyPresent);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(block = %block, peer = %peer, error = %e, "Check failed, trying next holder");
                    continue;
                }
            }

            let payload = match &data {
                Some(payload) => payload.clone(),
                None => match self.store.get_block(&block)? {
                    Some(payload) => {
                        data = Some(payload.clone());
                        payload
                    }
                    None => {
                        debug!(block = %block, "Block no longer stored locally");
                        return Ok(Placement::Vanished);
                    }
                },
            };

            match self.sender.put_block(peer, block, payload).await {
                Ok(()) => {
                    debug!(block = %block, peer = %peer, "Block transferred");
                    self.gc.mark_reclaimable(block);
                    return Ok(Placement::Transferred);
                }
                Err(e) => {
                    warn!(block = %block, peer = %peer, error = %e, "Transfer failed, trying next holder");
                }
            }
        }

        Ok(Placement::Deferred)
    }
}

pub struct Rebalancer {
    mover: Mover,
    metadata: Arc<dyn MetadataBackend>,
    topology: Arc<dyn Topology>,
    batch_size: usize,
    volume: Option<VolumeId>,
    lease: Option<LeaseId>,
    session: Option<Session>,
    deferred: VecDeque<BlockRef>,
}

impl Rebalancer {
    pub fn new(
        store: Arc<dyn BlockStore>,
        metadata: Arc<dyn MetadataBackend>,
        topology: Arc<dyn Topology>,
        sender: Arc<dyn CheckAndSender>,
        gc: Arc<dyn GarbageCollector>,
        batch_size: usize,
    ) -> Self {
        Self {
            mover: Mover { store, sender, gc },
            metadata,
            topology,
            batch_size: batch_size.max(1),
            volume: None,
            lease: None,
            session: None,
            deferred: VecDeque::new(),
        }
    }

    /// Volume the rebalancer is scoped to
    pub fn volume(&self) -> Option<VolumeId> {
        self.volume
    }

    /// Scope the rebalancer to `volume`. The volume must be locked by a
    /// live lease.
    #[instrument(skip(self))]
    pub async fn prep_volume(&mut self, volume: VolumeId) -> Result<()> {
        let Some(holder) = self.metadata.lease_holder(volume).await? else {
            return Err(BlockRingError::NotLocked(volume.to_string()));
        };
        self.mover.gc.prep_volume(volume)?;
        self.session = None;
        self.deferred.clear();
        self.volume = Some(volume);
        self.lease = Some(holder);
        info!("Rebalancer scoped to volume");
        Ok(())
    }

    /// Ring version the open pass is pinned to, or the latest version
    pub fn version_start(&self) -> u64 {
        match &self.session {
            Some(session) => session.ring.version(),
            None => self.topology.ring().version(),
        }
    }

    /// Whether a pass is in progress
    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    /// Abandon the current pass and forget every mark
    pub fn reset(&mut self) {
        self.session = None;
        self.deferred.clear();
        self.mover.gc.clear();
    }

    /// Examine up to `batch_size` blocks
    pub async fn tick(&mut self) -> Result<TickReport> {
        let volume = self
            .volume
            .ok_or_else(|| BlockRingError::Internal("tick before prep_volume".to_string()))?;

        match self.run_tick(volume).await {
            Ok(report) => {
                metrics::record_tick(&volume.to_string(), &report);
                Ok(report)
            }
            Err(e) => Err(self.fail(volume, e)),
        }
    }

    async fn run_tick(&mut self, volume: VolumeId) -> Result<TickReport> {
        let holder = self.metadata.lease_holder(volume).await?;
        if holder != self.lease {
            warn!(volume = %volume, holder = ?holder, "Volume lease lost");
            return Err(BlockRingError::NotLocked(volume.to_string()));
        }

        if self.session.is_none() {
            let ring = self.topology.ring();
            let blocks = self.mover.store.block_iterator(volume)?;
            info!(volume = %volume, version = ring.version(), "Starting rebalance pass");
            self.session = Some(Session { ring, blocks });
        }

        let (ring, batch, exhausted) = self.next_batch()?;
        let local = self.topology.local_peer().to_string();
        let mover = self.mover.clone();
        let mut report = TickReport {
            version: ring.version(),
            ..Default::default()
        };

        for block in batch {
            report.examined += 1;
            match mover.place(ring.as_ref(), &local, block).await? {
                Placement::Kept => report.kept += 1,
                Placement::Transferred => report.transferred += 1,
                Placement::AlreadyPresent => report.already_present += 1,
                Placement::Deferred => {
                    self.deferred.push_back(block);
                    report.deferred += 1;
                }
                Placement::Vanished => {}
            }
        }

        let latest = self.topology.ring().version();
        if latest != ring.version() {
            // Decisions made under the old version stay valid; pending ones do not
            info!(
                volume = %volume,
                from = ring.version(),
                to = latest,
                "Ring changed during pass, restarting"
            );
            self.session = None;
            self.deferred.clear();
            report.restart_required = true;
        } else if exhausted {
            debug!(volume = %volume, retries = self.deferred.len(), "Rebalance pass complete");
            // Anything still deferred is revisited by the next pass
            self.session = None;
            self.deferred.clear();
            report.exhausted = true;
        }

        Ok(report)
    }

    /// Retries take at most half the batch while the iterator has more, so
    /// the pass keeps advancing past refs whose holders are down. Once the
    /// iterator is dry they fill whatever room is left.
    fn next_batch(&mut self) -> Result<(Arc<dyn Ring>, Vec<BlockRef>, bool)> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BlockRingError::Internal("no open rebalance session".to_string()))?;

        let mut batch = Vec::with_capacity(self.batch_size);
        let retries = self.batch_size / 2;
        while batch.len() < retries {
            match self.deferred.pop_front() {
                Some(block) => batch.push(block),
                None => break,
            }
        }

        let mut exhausted = false;
        while batch.len() < self.batch_size {
            match session.blocks.next() {
                Some(block) => batch.push(block?),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            while batch.len() < self.batch_size {
                match self.deferred.pop_front() {
                    Some(block) => batch.push(block),
                    None => break,
                }
            }
        }

        Ok((session.ring.clone(), batch, exhausted))
    }

    fn fail(&mut self, volume: VolumeId, e: BlockRingError) -> BlockRingError {
        error!(volume = %volume, error = %e, "Rebalance tick failed, resetting");
        metrics::record_failure(&volume.to_string());
        self.reset();
        e
    }
}
