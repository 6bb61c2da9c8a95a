//! tdp listener
//!
//! One task accepts connections, one task per connection reads frames, and
//! one task per request runs the handler. Responses funnel through a single
//! writer per connection. Aborting the accept task drops its `JoinSet`,
//! which aborts every connection below it.

use super::frame::{self, Request, RequestFrame, Response, ResponseFrame};
use crate::rpc::{put_batch, Listener, Rpc, RpcServer};
use async_trait::async_trait;
use blockring_core::{BlockRingError, GlobalMetadata, Result};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

/// Responses buffered per connection before handlers wait on the writer
const RESPONSE_QUEUE: usize = 64;

/// Listener factory for the `tdp` scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct TdpListener;

#[async_trait]
impl Listener for TdpListener {
    async fn listen(
        &self,
        addr: &str,
        handler: Arc<dyn Rpc>,
        global: GlobalMetadata,
    ) -> Result<Box<dyn RpcServer>> {
        Ok(Box::new(TdpServer::bind(addr, handler, global).await?))
    }
}

/// Running tdp listener
pub struct TdpServer {
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TdpServer {
    /// Bind and start accepting in the background
    pub async fn bind(addr: &str, handler: Arc<dyn Rpc>, global: GlobalMetadata) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BlockRingError::Transport(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let accept_task = tokio::spawn(accept_loop(listener, handler, global));
        info!(addr = %local_addr, "tdp server started");

        Ok(Self {
            local_addr,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

#[async_trait]
impl RpcServer for TdpServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
            // Wait for the accept loop to be dropped along with its connections
            let _ = task.await;
            info!(addr = %self.local_addr, "tdp server closed");
        }
        Ok(())
    }
}

impl Drop for TdpServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn Rpc>, global: GlobalMetadata) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    connections.spawn(serve_connection(stream, peer, handler.clone(), global));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

#[instrument(skip(stream, handler, global))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Rpc>,
    global: GlobalMetadata,
) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut frames) = Framed::new(stream, frame::codec(&global)).split();
    let (tx, mut rx) = mpsc::channel::<ResponseFrame>(RESPONSE_QUEUE);
    let mut tasks = JoinSet::new();

    tasks.spawn(async move {
        while let Some(response) = rx.recv().await {
            let payload = match frame::encode(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode response");
                    continue;
                }
            };
            if let Err(e) = sink.send(payload).await {
                debug!(error = %e, "Connection write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            next = frames.next() => {
                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        debug!(error = %e, "Connection read failed");
                        break;
                    }
                    None => break,
                };
                let request: RequestFrame = match frame::decode(&bytes) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Malformed request frame, dropping connection");
                        break;
                    }
                };

                let handler = handler.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let body = dispatch(handler.as_ref(), request.body).await;
                    let _ = tx.send(ResponseFrame { id: request.id, body }).await;
                });
            }
            Some(_) = tasks.join_next() => {}
        }
    }

    // Let in-flight requests answer, then the writer drains and exits
    drop(tx);
    while tasks.join_next().await.is_some() {}
    debug!("Connection closed");
}

async fn dispatch(handler: &dyn Rpc, request: Request) -> Response {
    let op = request.op();
    let response = match request {
        Request::Block { block } => match handler.block(block).await {
            Ok(data) => Response::Block { data },
            Err(e) => Response::error(&e),
        },
        Request::PutBlock { refs, blocks } => match put_batch(handler, refs, blocks).await {
            Ok(()) => Response::Put,
            Err(e) => Response::error(&e),
        },
        Request::RebalanceCheck { refs } => match handler.rebalance_check(refs).await {
            Ok(valid) => Response::Check { valid },
            Err(e) => Response::error(&e),
        },
    };

    if matches!(response, Response::Error { .. }) {
        counter!("blockring_rpc_errors_total", "op" => op).increment(1);
    }
    response
}
