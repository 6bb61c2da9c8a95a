//! Serving side of the block RPC over a local store

use crate::rpc::Rpc;
use async_trait::async_trait;
use blockring_core::{BlockRef, BlockRingError, Result};
use blockring_storage::BlockStore;
use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, instrument};

/// `Rpc` implementation backed by a [`BlockStore`]
pub struct StoreHandler {
    store: Arc<dyn BlockStore>,
    node_id: String,
}

impl StoreHandler {
    pub fn new(store: Arc<dyn BlockStore>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl Rpc for StoreHandler {
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn block(&self, block: BlockRef) -> Result<Bytes> {
        counter!("blockring_rpc_served_total", "op" => "block").increment(1);
        self.store
            .get_block(&block)?
            .ok_or_else(|| BlockRingError::BlockNotFound(block.to_string()))
    }

    #[instrument(skip(self, data), fields(node_id = %self.node_id, size = data.len()))]
    async fn put_block(&self, block: BlockRef, data: Bytes) -> Result<()> {
        counter!("blockring_rpc_served_total", "op" => "put_block").increment(1);
        self.store.write_block(block, data)?;
        debug!(block = %block, "Accepted block");
        Ok(())
    }

    #[instrument(skip(self, refs), fields(node_id = %self.node_id, count = refs.len()))]
    async fn rebalance_check(&self, refs: Vec<BlockRef>) -> Result<Vec<bool>> {
        counter!("blockring_rpc_served_total", "op" => "rebalance_check").increment(1);
        refs.iter().map(|r| self.store.has_block(r)).collect()
    }
}
