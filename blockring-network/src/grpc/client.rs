//! gRPC client connection
//!
//! Wraps one tonic channel. Calls clone the channel handle, so concurrent
//! calls multiplex over the same HTTP/2 connection.

use super::proto::{
    to_messages, BlockRequest, BlockResponse, PutBlockRequest, PutBlockResponse,
    RebalanceCheckRequest, RebalanceCheckResponse,
};
use super::{from_status, BLOCK_PATH, PUT_BLOCK_PATH, REBALANCE_CHECK_PATH};
use crate::rpc::{Dialer, Rpc, RpcClient};
use crate::tdp::frame::max_frame_length;
use async_trait::async_trait;
use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, Result};
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

/// Dialer for the `http` scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcDialer;

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
        global: GlobalMetadata,
    ) -> Result<Arc<dyn RpcClient>> {
        Ok(Arc::new(GrpcClient::connect(addr, timeout, global).await?))
    }
}

/// Client end of a gRPC connection
pub struct GrpcClient {
    addr: String,
    /// `None` once closed
    grpc: Mutex<Option<Grpc<Channel>>>,
}

impl GrpcClient {
    /// Connect to `addr`, giving up after `timeout`
    #[instrument(skip(global))]
    pub async fn connect(addr: &str, timeout: Duration, global: GlobalMetadata) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| BlockRingError::InvalidUrl(format!("{}: {}", addr, e)))?
            .connect_timeout(timeout)
            .tcp_nodelay(true);

        let channel = match tokio::time::timeout(timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return Err(BlockRingError::Transport(format!(
                    "connection failed to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(BlockRingError::Transport(format!(
                    "connection to {} timed out after {:?}",
                    addr, timeout
                )))
            }
        };
        debug!(addr = %addr, "gRPC connection established");

        let limit = max_frame_length(&global);
        let grpc = Grpc::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);

        Ok(Self {
            addr: addr.to_string(),
            grpc: Mutex::new(Some(grpc)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn unary<Req, Resp>(&self, op: &'static str, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc.lock().clone().ok_or(BlockRingError::Closed)?;
        counter!("blockring_rpc_calls_total", "op" => op).increment(1);

        grpc.ready().await.map_err(|e| {
            BlockRingError::Transport(format!("connection to {} not ready: {}", self.addr, e))
        })?;
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await
            .map_err(from_status)?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl Rpc for GrpcClient {
    async fn block(&self, block: BlockRef) -> Result<Bytes> {
        let request = BlockRequest {
            block: Some(block.into()),
        };
        let response: BlockResponse = self.unary("block", BLOCK_PATH, request).await?;
        Ok(response.data)
    }

    async fn put_block(&self, block: BlockRef, data: Bytes) -> Result<()> {
        self.put_blocks(vec![block], vec![data]).await
    }

    async fn rebalance_check(&self, refs: Vec<BlockRef>) -> Result<Vec<bool>> {
        let expected = refs.len();
        let request = RebalanceCheckRequest {
            refs: to_messages(refs),
        };
        let response: RebalanceCheckResponse = self
            .unary("rebalance_check", REBALANCE_CHECK_PATH, request)
            .await?;
        if response.valid.len() != expected {
            return Err(BlockRingError::Transport(format!(
                "check reply from {} has {} entries, expected {}",
                self.addr,
                response.valid.len(),
                expected
            )));
        }
        Ok(response.valid)
    }
}

#[async_trait]
impl RpcClient for GrpcClient {
    async fn put_blocks(&self, refs: Vec<BlockRef>, blocks: Vec<Bytes>) -> Result<()> {
        if refs.len() != blocks.len() {
            return Err(BlockRingError::Rejected(format!(
                "batch has {} refs but {} blocks",
                refs.len(),
                blocks.len()
            )));
        }
        let request = PutBlockRequest {
            refs: to_messages(refs),
            blocks,
        };
        let _: PutBlockResponse = self.unary("put_block", PUT_BLOCK_PATH, request).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.grpc.lock().take().is_some() {
            debug!(addr = %self.addr, "gRPC connection closed");
        }
        Ok(())
    }
}
