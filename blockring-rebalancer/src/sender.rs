//! Peer-directed check and transfer
//!
//! [`CheckAndSender`] is the rebalancer's only view of other peers.
//! [`PeerSender`] implements it over the protocol registry with one cached
//! connection per peer.

use crate::metrics::names;
use async_trait::async_trait;
use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, PeerId, Result};
use blockring_network::{PeerUrl, ProtocolRegistry, RpcClient};
use bytes::Bytes;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[async_trait]
pub trait CheckAndSender: Send + Sync {
    /// Which of `refs` the peer already holds, positionally
    async fn check(&self, peer: &str, refs: &[BlockRef]) -> Result<Vec<bool>>;

    /// Transfer one block to the peer
    async fn put_block(&self, peer: &str, block: BlockRef, data: Bytes) -> Result<()>;
}

/// Per-request deadline unless overridden
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// [`CheckAndSender`] that dials peers through a [`ProtocolRegistry`]
pub struct PeerSender {
    registry: Arc<ProtocolRegistry>,
    global: GlobalMetadata,
    dial_timeout: Duration,
    request_timeout: Duration,
    /// Peer id -> URL
    directory: RwLock<HashMap<PeerId, PeerUrl>>,
    /// Connection cache: peer id -> client
    connections: RwLock<HashMap<PeerId, Arc<dyn RpcClient>>>,
}

impl PeerSender {
    pub fn new(registry: Arc<ProtocolRegistry>, global: GlobalMetadata, dial_timeout: Duration) -> Self {
        Self {
            registry,
            global,
            dial_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            directory: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Bound every check and transfer on an open connection
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add or move a peer. A moved peer's cached connection is dropped.
    pub fn update_peer(&self, peer: impl Into<PeerId>, url: PeerUrl) {
        let peer = peer.into();
        let previous = self.directory.write().insert(peer.clone(), url.clone());
        if previous.as_ref() != Some(&url) {
            self.connections.write().remove(&peer);
            info!(peer = %peer, url = %url, "Peer address updated");
        }
    }

    pub fn remove_peer(&self, peer: &str) {
        self.directory.write().remove(peer);
        self.connections.write().remove(peer);
    }

    /// Known peers, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.directory.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Get or create the connection for a peer
    async fn client(&self, peer: &str) -> Result<Arc<dyn RpcClient>> {
        let cached = self.connections.read().get(peer).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let url = self
            .directory
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| BlockRingError::Transport(format!("unknown peer {}", peer)))?;

        debug!(peer = %peer, url = %url, "Dialing peer");
        let client = self
            .registry
            .dial(&url, self.dial_timeout, self.global)
            .await?;
        self.connections
            .write()
            .insert(peer.to_string(), client.clone());
        Ok(client)
    }

    /// Run one call against `peer`, failing with a transport error on deadline
    async fn bounded<T>(&self, peer: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BlockRingError::Transport(format!(
                "request to {} timed out after {:?}",
                peer, self.request_timeout
            ))),
        }
    }

    /// Remove a failed connection so the next call redials
    async fn evict(&self, peer: &str, error: &BlockRingError) {
        counter!(names::PEER_ERRORS, "peer" => peer.to_string()).increment(1);
        if !error.is_retryable() {
            return;
        }
        let removed = self.connections.write().remove(peer);
        if let Some(client) = removed {
            warn!(peer = %peer, error = %error, "Dropping peer connection");
            let _ = client.close().await;
        }
    }
}

#[async_trait]
impl CheckAndSender for PeerSender {
    #[instrument(skip(self, refs), fields(count = refs.len()))]
    async fn check(&self, peer: &str, refs: &[BlockRef]) -> Result<Vec<bool>> {
        let client = self.client(peer).await?;
        let result = match self.bounded(peer, client.rebalance_check(refs.to_vec())).await {
            Ok(valid) if valid.len() == refs.len() => Ok(valid),
            Ok(valid) => Err(BlockRingError::Transport(format!(
                "check reply from {} has {} entries, expected {}",
                peer,
                valid.len(),
                refs.len()
            ))),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.evict(peer, e).await;
        }
        result
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put_block(&self, peer: &str, block: BlockRef, data: Bytes) -> Result<()> {
        let client = self.client(peer).await?;
        let result = self.bounded(peer, client.put_block(block, data)).await;
        if let Err(e) = &result {
            self.evict(peer, e).await;
        }
        result
    }
}
