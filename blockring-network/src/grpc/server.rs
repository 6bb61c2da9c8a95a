//! gRPC listener
//!
//! [`BlockServiceServer`] routes each unary method to the shared
//! [`Rpc`] handler; tonic's server owns the accept loop and connections.

use super::proto::{
    from_messages, BlockRequest, BlockResponse, PutBlockRequest, PutBlockResponse,
    RebalanceCheckRequest, RebalanceCheckResponse,
};
use super::{to_status, BLOCK_PATH, PUT_BLOCK_PATH, REBALANCE_CHECK_PATH, SERVICE};
use crate::rpc::{put_batch, Listener, Rpc, RpcServer};
use crate::tdp::frame::max_frame_length;
use async_trait::async_trait;
use blockring_core::{BlockRingError, GlobalMetadata, Result};
use metrics::counter;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::transport::Server;
use tonic::Status;
use tracing::{debug, info, warn};

/// How long `close` lets in-flight calls finish before cutting connections
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Listener factory for the `http` scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcListener;

#[async_trait]
impl Listener for GrpcListener {
    async fn listen(
        &self,
        addr: &str,
        handler: Arc<dyn Rpc>,
        global: GlobalMetadata,
    ) -> Result<Box<dyn RpcServer>> {
        Ok(Box::new(GrpcServer::bind(addr, handler, global).await?))
    }
}

/// Running gRPC listener
pub struct GrpcServer {
    local_addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GrpcServer {
    /// Bind and start serving in the background
    pub async fn bind(addr: &str, handler: Arc<dyn Rpc>, global: GlobalMetadata) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BlockRingError::Transport(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let service = BlockServiceServer::new(handler, max_frame_length(&global));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "gRPC server stopped with error");
            }
        });
        info!(addr = %local_addr, "gRPC server started");

        Ok(Self {
            local_addr,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl RpcServer for GrpcServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!(addr = %self.local_addr, "Graceful stop timed out, aborting");
                task.abort();
            }
            info!(addr = %self.local_addr, "gRPC server closed");
        }
        Ok(())
    }
}

impl Drop for GrpcServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn failed(op: &'static str, err: &BlockRingError) -> Status {
    counter!("blockring_rpc_errors_total", "op" => op).increment(1);
    to_status(err)
}

struct BlockMethod(Arc<dyn Rpc>);

impl UnaryService<BlockRequest> for BlockMethod {
    type Response = BlockResponse;
    type Future = BoxFuture<tonic::Response<BlockResponse>, Status>;

    fn call(&mut self, request: tonic::Request<BlockRequest>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let block = request
                .into_inner()
                .block
                .ok_or_else(|| Status::invalid_argument("missing block ref"))?;
            let data = handler
                .block(block.into())
                .await
                .map_err(|e| failed("block", &e))?;
            Ok(tonic::Response::new(BlockResponse { data }))
        })
    }
}

struct PutBlockMethod(Arc<dyn Rpc>);

impl UnaryService<PutBlockRequest> for PutBlockMethod {
    type Response = PutBlockResponse;
    type Future = BoxFuture<tonic::Response<PutBlockResponse>, Status>;

    fn call(&mut self, request: tonic::Request<PutBlockRequest>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let request = request.into_inner();
            put_batch(handler.as_ref(), from_messages(request.refs), request.blocks)
                .await
                .map_err(|e| failed("put_block", &e))?;
            Ok(tonic::Response::new(PutBlockResponse {}))
        })
    }
}

struct RebalanceCheckMethod(Arc<dyn Rpc>);

impl UnaryService<RebalanceCheckRequest> for RebalanceCheckMethod {
    type Response = RebalanceCheckResponse;
    type Future = BoxFuture<tonic::Response<RebalanceCheckResponse>, Status>;

    fn call(&mut self, request: tonic::Request<RebalanceCheckRequest>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let refs = from_messages(request.into_inner().refs);
            let valid = handler
                .rebalance_check(refs)
                .await
                .map_err(|e| failed("rebalance_check", &e))?;
            Ok(tonic::Response::new(RebalanceCheckResponse { valid }))
        })
    }
}

/// tonic service for `blockring.BlockService`
#[derive(Clone)]
pub struct BlockServiceServer {
    handler: Arc<dyn Rpc>,
    max_message_size: usize,
}

impl BlockServiceServer {
    pub fn new(handler: Arc<dyn Rpc>, max_message_size: usize) -> Self {
        Self {
            handler,
            max_message_size,
        }
    }
}

impl NamedService for BlockServiceServer {
    const NAME: &'static str = SERVICE;
}

impl<B> Service<http::Request<B>> for BlockServiceServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let handler = self.handler.clone();
        let limit = self.max_message_size;

        match req.uri().path() {
            BLOCK_PATH => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::<BlockResponse, BlockRequest>::default())
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit);
                Ok(grpc.unary(BlockMethod(handler), req).await)
            }),
            PUT_BLOCK_PATH => Box::pin(async move {
                let mut grpc =
                    Grpc::new(ProstCodec::<PutBlockResponse, PutBlockRequest>::default())
                        .max_decoding_message_size(limit)
                        .max_encoding_message_size(limit);
                Ok(grpc.unary(PutBlockMethod(handler), req).await)
            }),
            REBALANCE_CHECK_PATH => Box::pin(async move {
                let mut grpc = Grpc::new(
                    ProstCodec::<RebalanceCheckResponse, RebalanceCheckRequest>::default(),
                )
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit);
                Ok(grpc.unary(RebalanceCheckMethod(handler), req).await)
            }),
            _ => Box::pin(async move { Ok(Status::unimplemented("unknown method").to_http()) }),
        }
    }
}
