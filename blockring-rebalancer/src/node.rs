//! Node runtime
//!
//! Wires the local store, the metadata backend, the peer server and one
//! rebalance loop per volume into a running node.

use crate::config::NodeConfig;
use crate::gc::ReclaimGc;
use crate::rebalancer::Rebalancer;
use crate::scheduler::RebalanceLoop;
use crate::sender::PeerSender;
use anyhow::Context;
use blockring_core::{BlockRingError, HashRing, Ring, SharedRing, Topology};
use blockring_metadata::{open_backend, BlockVolume, MetadataBackend};
use blockring_network::{ProtocolRegistry, RpcServer, StoreHandler};
use blockring_storage::{open_store, BlockStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One volume this node is rebalancing
struct ManagedVolume {
    volume: Arc<BlockVolume>,
    gc: Arc<ReclaimGc>,
    rebalance: RebalanceLoop,
}

pub struct Node {
    store: Arc<dyn BlockStore>,
    metadata: Arc<dyn MetadataBackend>,
    topology: Arc<SharedRing>,
    sender: Arc<PeerSender>,
    server: Box<dyn RpcServer>,
    volumes: Vec<ManagedVolume>,
    background: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Open storage, start serving peers and start rebalancing
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = open_store(&config.storage).context("opening block store")?;
        let metadata = open_backend(&config.metadata).context("opening metadata backend")?;
        Self::start_with(config, store, metadata).await
    }

    /// Start on an already opened store and metadata backend
    pub async fn start_with(
        config: NodeConfig,
        store: Arc<dyn BlockStore>,
        metadata: Arc<dyn MetadataBackend>,
    ) -> anyhow::Result<Self> {
        let node_id = config.node.id.clone();
        let global = metadata.global_metadata().await?;
        let peers = config.peer_urls()?;

        let mut members: Vec<String> = peers.iter().map(|(id, _)| id.clone()).collect();
        members.push(node_id.clone());
        let ring: Arc<dyn Ring> = Arc::new(HashRing::new(1, members, global.replication));
        let topology = Arc::new(SharedRing::new(node_id.clone(), ring));

        let registry = Arc::new(ProtocolRegistry::with_defaults());
        let handler = Arc::new(StoreHandler::new(store.clone(), node_id.clone()));
        let server = registry
            .listen(&config.listen_url()?, handler, global)
            .await
            .context("starting peer server")?;

        let sender = Arc::new(
            PeerSender::new(registry, global, config.rebalance.dial_timeout())
                .with_request_timeout(config.rebalance.request_timeout()),
        );
        for (id, url) in peers {
            sender.update_peer(id, url);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut node = Self {
            store,
            metadata,
            topology,
            sender,
            server,
            volumes: Vec::new(),
            background: Vec::new(),
            shutdown_tx,
        };

        let names = if config.rebalance.volumes.is_empty() {
            node.metadata
                .list_volumes()
                .await?
                .into_iter()
                .map(|v| v.name)
                .collect()
        } else {
            config.rebalance.volumes.clone()
        };
        for name in names {
            if let Err(e) = node.manage_volume(&config, &name).await {
                node.shutdown().await;
                return Err(e.context(format!("starting rebalance for volume {}", name)));
            }
        }

        node.spawn_lease_refresh(config.metadata.lease_ttl(), shutdown_rx.clone());
        node.spawn_sweeper(config.rebalance.sweep_interval(), shutdown_rx);

        info!(
            node_id = %node_id,
            addr = %node.local_addr(),
            volumes = node.volumes.len(),
            "Node started"
        );
        Ok(node)
    }

    async fn manage_volume(&mut self, config: &NodeConfig, name: &str) -> anyhow::Result<()> {
        let volume = match BlockVolume::open(self.metadata.clone(), name).await {
            Ok(volume) => volume,
            Err(BlockRingError::VolumeNotFound(_)) => {
                let block_size = self.metadata.global_metadata().await?.block_size;
                BlockVolume::create_block_volume(self.metadata.clone(), name, block_size).await?
            }
            Err(e) => return Err(e.into()),
        }
        .with_lease_ttl(config.metadata.lease_ttl());
        let lease = self.metadata.grant_lease().await?;
        volume.lock(lease).await?;
        let volume = Arc::new(volume);

        let gc = Arc::new(ReclaimGc::new(self.store.clone()));
        let mut rebalancer = Rebalancer::new(
            self.store.clone(),
            self.metadata.clone(),
            self.topology.clone(),
            self.sender.clone(),
            gc.clone(),
            config.rebalance.batch_size,
        );
        if let Err(e) = rebalancer.prep_volume(volume.id()).await {
            let _ = volume.unlock().await;
            return Err(e.into());
        }

        let rebalance = RebalanceLoop::spawn(rebalancer, config.rebalance.tick_interval());
        info!(volume = %name, lease = %lease, "Rebalancing volume");
        self.volumes.push(ManagedVolume {
            volume,
            gc,
            rebalance,
        });
        Ok(())
    }

    /// Keep every volume lease alive at a third of its TTL
    fn spawn_lease_refresh(&mut self, ttl: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let volumes: Vec<Arc<BlockVolume>> = self.volumes.iter().map(|v| v.volume.clone()).collect();
        if volumes.is_empty() {
            return;
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for volume in &volumes {
                            let Some(lease) = volume.lease() else { continue };
                            // The volume's rebalance loop stops on its next tick
                            if let Err(e) = volume.lock(lease).await {
                                error!(volume = %volume.volume().name, error = %e, "Lease refresh failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.background.push(handle);
    }

    /// Periodically delete blocks confirmed on their authorized holders
    fn spawn_sweeper(&mut self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let gcs: Vec<Arc<ReclaimGc>> = self.volumes.iter().map(|v| v.gc.clone()).collect();
        if gcs.is_empty() {
            return;
        }
        let topology = self.topology.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ring = topology.ring();
                        for gc in &gcs {
                            if let Err(e) = gc.sweep(ring.as_ref(), topology.local_peer()) {
                                error!(error = %e, "GC sweep failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.background.push(handle);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn topology(&self) -> &Arc<SharedRing> {
        &self.topology
    }

    pub fn sender(&self) -> &Arc<PeerSender> {
        &self.sender
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Stop rebalancing, release leases, close the server and flush
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }

        for managed in self.volumes.drain(..) {
            let name = managed.volume.volume().name.clone();
            match managed.rebalance.shutdown().await {
                Ok(mut rebalancer) => rebalancer.reset(),
                Err(e) => warn!(volume = %name, error = %e, "Rebalance loop did not stop cleanly"),
            }
            if let Err(e) = managed.volume.unlock().await {
                warn!(volume = %name, error = %e, "Failed to release volume lease");
            }
        }

        if let Err(e) = self.server.close().await {
            warn!(error = %e, "Failed to close peer server");
        }
        if let Err(e) = self.store.flush() {
            error!(error = %e, "Failed to flush block store");
        }
        info!("Node stopped");
    }
}
