//! Garbage collection of transferred blocks
//!
//! The rebalancer only marks blocks; [`ReclaimGc::sweep`] is the one place a
//! block ever gets deleted, and only when the ring at sweep time still says
//! this node should not hold it.

use crate::metrics::names;
use blockring_core::{BlockRef, Result, Ring, VolumeId};
use blockring_storage::BlockStore;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the rebalancer tells the collector
pub trait GarbageCollector: Send + Sync {
    /// Scope collection to one volume, discarding marks for any other
    fn prep_volume(&self, volume: VolumeId) -> Result<()>;

    /// A block that has been confirmed on an authorized holder
    fn mark_reclaimable(&self, block: BlockRef);

    /// Drop every mark
    fn clear(&self);
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Blocks deleted from the local store
    pub deleted: usize,
    /// Marks dropped because this node is authorized again
    pub retained: usize,
    /// Marks left for a later sweep
    pub pending: usize,
}

#[derive(Default)]
struct GcState {
    volume: Option<VolumeId>,
    pending: BTreeSet<BlockRef>,
}

/// Collector that deletes marked blocks on [`sweep`](ReclaimGc::sweep)
pub struct ReclaimGc {
    store: Arc<dyn BlockStore>,
    state: Mutex<GcState>,
}

impl ReclaimGc {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            state: Mutex::new(GcState::default()),
        }
    }

    /// Marked blocks awaiting a sweep
    pub fn pending(&self) -> Vec<BlockRef> {
        self.state.lock().pending.iter().copied().collect()
    }

    pub fn volume(&self) -> Option<VolumeId> {
        self.state.lock().volume
    }

    /// Delete every marked block the local node is still not authorized to
    /// hold under `ring`.
    pub fn sweep(&self, ring: &dyn Ring, local_peer: &str) -> Result<SweepReport> {
        let marked: Vec<BlockRef> = std::mem::take(&mut self.state.lock().pending)
            .into_iter()
            .collect();
        let mut report = SweepReport::default();

        for (i, block) in marked.iter().enumerate() {
            let holders = match ring.lookup(block) {
                Ok(holders) => holders,
                Err(e) => {
                    warn!(block = %block, error = %e, "Lookup failed, keeping mark");
                    self.state.lock().pending.insert(*block);
                    report.pending += 1;
                    continue;
                }
            };

            if holders.iter().any(|p| p == local_peer) {
                debug!(block = %block, "Local node authorized again, keeping block");
                report.retained += 1;
                continue;
            }

            if let Err(e) = self.store.delete_block(block) {
                // Put back this block and everything not yet visited
                let mut state = self.state.lock();
                state.pending.extend(marked[i..].iter().copied());
                return Err(e);
            }
            report.deleted += 1;
        }

        if report.deleted > 0 {
            counter!(names::GC_RECLAIMED).increment(report.deleted as u64);
            info!(
                deleted = report.deleted,
                retained = report.retained,
                version = ring.version(),
                "GC sweep complete"
            );
        }
        Ok(report)
    }
}

impl GarbageCollector for ReclaimGc {
    fn prep_volume(&self, volume: VolumeId) -> Result<()> {
        let mut state = self.state.lock();
        if state.volume != Some(volume) {
            state.pending.clear();
            state.volume = Some(volume);
        }
        Ok(())
    }

    fn mark_reclaimable(&self, block: BlockRef) {
        let mut state = self.state.lock();
        if state.volume == Some(block.volume) {
            state.pending.insert(block);
        } else {
            debug!(block = %block, "Ignoring mark outside the scoped volume");
        }
    }

    fn clear(&self) {
        self.state.lock().pending.clear();
    }
}
