//! Drives a [`Rebalancer`] on its own task
//!
//! Ticks back to back while a pass has more work, then waits one interval.
//! A fatal tick error is logged and the loop keeps going on the next
//! interval; the rebalancer has already reset itself. Losing the volume
//! lease ends the loop.

use crate::rebalancer::{Rebalancer, TickReport};
use blockring_core::{BlockRingError, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct RebalanceLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Rebalancer>,
}

impl RebalanceLoop {
    /// Start ticking `rebalancer` every `interval`
    pub fn spawn(rebalancer: Rebalancer, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(rebalancer, interval, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Whether the loop has ended on its own
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop after the current tick and hand the rebalancer back
    pub async fn shutdown(self) -> Result<Rebalancer> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| BlockRingError::Internal(format!("rebalance loop panicked: {}", e)))
    }
}

async fn run(
    mut rebalancer: Rebalancer,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Rebalancer {
    let volume = rebalancer
        .volume()
        .map(|v| v.to_string())
        .unwrap_or_default();
    info!(volume = %volume, interval_ms = interval.as_millis() as u64, "Rebalance loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = drain(&mut rebalancer, &shutdown_rx).await {
                    warn!(volume = %volume, error = %e, "Volume lease lost, rebalancing stopped");
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                break;
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }

    info!(volume = %volume, "Rebalance loop stopped");
    rebalancer
}

/// Tick until the pass pauses, errors, or shutdown is requested. Only a
/// lost lease is returned as an error.
async fn drain(
    rebalancer: &mut Rebalancer,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<Option<TickReport>> {
    let mut last = None;
    loop {
        match rebalancer.tick().await {
            Ok(report) => {
                let more = report.has_more();
                last = Some(report);
                if !more || *shutdown_rx.borrow() {
                    return Ok(last);
                }
            }
            Err(e @ BlockRingError::NotLocked(_)) => return Err(e),
            Err(e) => {
                error!(error = %e, "Rebalance tick failed");
                return Ok(last);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ReclaimGc;
    use crate::sender::CheckAndSender;
    use async_trait::async_trait;
    use blockring_core::{BlockRef, SharedRing, StaticRing};
    use blockring_metadata::{MetadataBackend, TempMetadata};
    use blockring_storage::{BlockStore, MemoryBlockStore};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collecting {
        held: Mutex<HashSet<BlockRef>>,
    }

    #[async_trait]
    impl CheckAndSender for Collecting {
        async fn check(&self, _peer: &str, refs: &[BlockRef]) -> Result<Vec<bool>> {
            let held = self.held.lock();
            Ok(refs.iter().map(|r| held.contains(r)).collect())
        }

        async fn put_block(&self, _peer: &str, block: BlockRef, _data: Bytes) -> Result<()> {
            self.held.lock().insert(block);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_loop_moves_everything_and_stops() {
        let store = Arc::new(MemoryBlockStore::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(TempMetadata::new());
        let volume = metadata.create_volume("A", 4096).await.unwrap();
        let lease = metadata.grant_lease().await.unwrap();
        metadata
            .acquire_lease(volume.id, lease, Duration::from_secs(30))
            .await
            .unwrap();
        for i in 0..20 {
            store
                .write_block(BlockRef::new(volume.id, 1, i), Bytes::from_static(b"b"))
                .unwrap();
        }

        let sender = Arc::new(Collecting::default());
        let mut rebalancer = Rebalancer::new(
            store.clone(),
            metadata,
            Arc::new(SharedRing::new(
                "local",
                Arc::new(StaticRing::new(1, vec!["remote".to_string()])),
            )),
            sender.clone(),
            Arc::new(ReclaimGc::new(store)),
            3,
        );
        rebalancer.prep_volume(volume.id).await.unwrap();

        let handle = RebalanceLoop::spawn(rebalancer, Duration::from_millis(10));
        for _ in 0..100 {
            if sender.held.lock().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sender.held.lock().len(), 20);

        let rebalancer = handle.shutdown().await.unwrap();
        assert_eq!(rebalancer.volume(), Some(volume.id));
    }

    #[tokio::test]
    async fn test_loop_ends_when_lease_lost() {
        let store = Arc::new(MemoryBlockStore::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(TempMetadata::new());
        let volume = metadata.create_volume("A", 4096).await.unwrap();
        let lease = metadata.grant_lease().await.unwrap();
        metadata
            .acquire_lease(volume.id, lease, Duration::from_secs(30))
            .await
            .unwrap();

        let mut rebalancer = Rebalancer::new(
            store.clone(),
            metadata.clone(),
            Arc::new(SharedRing::new(
                "local",
                Arc::new(StaticRing::new(1, vec!["remote".to_string()])),
            )),
            Arc::new(Collecting::default()),
            Arc::new(ReclaimGc::new(store)),
            3,
        );
        rebalancer.prep_volume(volume.id).await.unwrap();
        let handle = RebalanceLoop::spawn(rebalancer, Duration::from_millis(10));

        // The lease lapses and another session locks the volume
        metadata.release_lease(volume.id, lease).await.unwrap();
        let other = metadata.grant_lease().await.unwrap();
        metadata
            .acquire_lease(volume.id, other, Duration::from_secs(30))
            .await
            .unwrap();

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished());
        let rebalancer = handle.shutdown().await.unwrap();
        assert!(!rebalancer.is_scanning());
    }
}
