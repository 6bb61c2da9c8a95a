//! Block RPC contract
//!
//! [`Rpc`] is what one peer asks of another. The serving side implements it
//! over its local store; a transport carries the calls and hands back an
//! [`RpcClient`] on dial and an [`RpcServer`] on listen.

use async_trait::async_trait;
use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Operations a peer serves; safe to call concurrently
#[async_trait]
pub trait Rpc: Send + Sync {
    /// Fetch a block, `BlockNotFound` if the peer does not hold it
    async fn block(&self, block: BlockRef) -> Result<Bytes>;

    /// Store a block; storing an already-held block overwrites it
    async fn put_block(&self, block: BlockRef, data: Bytes) -> Result<()>;

    /// For each ref, whether the peer already holds it. The reply is
    /// positional and as long as the request.
    async fn rebalance_check(&self, refs: Vec<BlockRef>) -> Result<Vec<bool>>;
}

/// Client side of a peer connection
#[async_trait]
pub trait RpcClient: Rpc {
    /// Store several blocks; any failure fails the whole batch
    async fn put_blocks(&self, refs: Vec<BlockRef>, blocks: Vec<Bytes>) -> Result<()> {
        if refs.len() != blocks.len() {
            return Err(BlockRingError::Rejected(format!(
                "batch has {} refs but {} blocks",
                refs.len(),
                blocks.len()
            )));
        }
        for (block, data) in refs.into_iter().zip(blocks) {
            self.put_block(block, data).await?;
        }
        Ok(())
    }

    /// Release the connection; later calls fail with `Closed`
    async fn close(&self) -> Result<()>;
}

/// Running listener
#[async_trait]
pub trait RpcServer: Send + Sync {
    /// Address the listener is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting and sever active sessions
    async fn close(&self) -> Result<()>;
}

/// Transport-side factory for listeners
#[async_trait]
pub trait Listener: Send + Sync {
    async fn listen(
        &self,
        addr: &str,
        handler: Arc<dyn Rpc>,
        global: GlobalMetadata,
    ) -> Result<Box<dyn RpcServer>>;
}

/// Transport-side factory for client connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
        global: GlobalMetadata,
    ) -> Result<Arc<dyn RpcClient>>;
}

/// Store a batch in order on the serving side, stopping at the first failure
pub(crate) async fn put_batch(
    handler: &dyn Rpc,
    refs: Vec<BlockRef>,
    blocks: Vec<Bytes>,
) -> Result<()> {
    if refs.len() != blocks.len() {
        return Err(BlockRingError::Rejected(format!(
            "batch has {} refs but {} blocks",
            refs.len(),
            blocks.len()
        )));
    }
    let total = refs.len();
    for (stored, (block, data)) in refs.into_iter().zip(blocks).enumerate() {
        if let Err(e) = handler.put_block(block, data).await {
            return Err(BlockRingError::Rejected(format!(
                "put batch failed at {} after {}/{} blocks: {}",
                block, stored, total, e
            )));
        }
    }
    Ok(())
}
