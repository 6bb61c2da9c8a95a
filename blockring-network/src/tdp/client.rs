//! tdp client connection
//!
//! A single background task owns the socket. Callers register a oneshot
//! under a fresh request id and hand the encoded frame to the task; the task
//! routes each response back by id. When the connection ends every pending
//! and later call fails with `Closed`.

use super::frame::{self, Request, RequestFrame, Response, ResponseFrame};
use crate::rpc::{Dialer, Rpc, RpcClient};
use async_trait::async_trait;
use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// Outgoing frames queued before callers wait on the socket
const REQUEST_QUEUE: usize = 64;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Frees a request id when its caller stops waiting
struct Slot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Dialer for the `tdp` scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct TdpDialer;

#[async_trait]
impl Dialer for TdpDialer {
    async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
        global: GlobalMetadata,
    ) -> Result<Arc<dyn RpcClient>> {
        Ok(Arc::new(TdpClient::connect(addr, timeout, global).await?))
    }
}

/// Client end of a tdp connection
pub struct TdpClient {
    addr: String,
    next_id: AtomicU64,
    outbound: mpsc::Sender<Bytes>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for TdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdpClient")
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TdpClient {
    /// Connect to `addr`, giving up after `timeout`
    #[instrument(skip(global))]
    pub async fn connect(addr: &str, timeout: Duration, global: GlobalMetadata) -> Result<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
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
        let _ = stream.set_nodelay(true);
        debug!(addr = %addr, "tdp connection established");

        let (outbound, rx) = mpsc::channel(REQUEST_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_connection(
            Framed::new(stream, frame::codec(&global)),
            rx,
            pending.clone(),
            closed.clone(),
        ));

        Ok(Self {
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            outbound,
            pending,
            closed,
            task,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call(&self, body: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(BlockRingError::Closed);
        }
        counter!("blockring_rpc_calls_total", "op" => body.op()).increment(1);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = frame::encode(&RequestFrame { id, body })?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _slot = Slot {
            pending: &self.pending,
            id,
        };

        // Closing after the insert has to see our entry; closing before it
        // is caught here.
        if self.is_closed() || self.outbound.send(payload).await.is_err() {
            return Err(BlockRingError::Closed);
        }

        rx.await.map_err(|_| BlockRingError::Closed)
    }

    fn unexpected(&self, response: Response) -> BlockRingError {
        match response {
            Response::Error { kind, message } => kind.into_error(message),
            other => BlockRingError::Transport(format!(
                "unexpected response from {}: {:?}",
                self.addr, other
            )),
        }
    }
}

impl Drop for TdpClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Rpc for TdpClient {
    async fn block(&self, block: BlockRef) -> Result<Bytes> {
        match self.call(Request::Block { block }).await? {
            Response::Block { data } => Ok(data),
            other => Err(self.unexpected(other)),
        }
    }

    async fn put_block(&self, block: BlockRef, data: Bytes) -> Result<()> {
        self.put_blocks(vec![block], vec![data]).await
    }

    async fn rebalance_check(&self, refs: Vec<BlockRef>) -> Result<Vec<bool>> {
        let expected = refs.len();
        match self.call(Request::RebalanceCheck { refs }).await? {
            Response::Check { valid } if valid.len() == expected => Ok(valid),
            Response::Check { valid } => Err(BlockRingError::Transport(format!(
                "check reply from {} has {} entries, expected {}",
                self.addr,
                valid.len(),
                expected
            ))),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl RpcClient for TdpClient {
    async fn put_blocks(&self, refs: Vec<BlockRef>, blocks: Vec<Bytes>) -> Result<()> {
        if refs.len() != blocks.len() {
            return Err(BlockRingError::Rejected(format!(
                "batch has {} refs but {} blocks",
                refs.len(),
                blocks.len()
            )));
        }
        match self.call(Request::PutBlock { refs, blocks }).await? {
            Response::Put => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.task.abort();
            self.pending.lock().clear();
            debug!(addr = %self.addr, "tdp connection closed");
        }
        Ok(())
    }
}

async fn run_connection(
    framed: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) {
    let (mut sink, mut frames) = framed.split();

    loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(payload) => {
                    if let Err(e) = sink.send(payload).await {
                        warn!(error = %e, "tdp write failed");
                        break;
                    }
                }
                None => break,
            },
            response = frames.next() => match response {
                Some(Ok(bytes)) => match frame::decode::<ResponseFrame>(&bytes) {
                    Ok(response) => {
                        let waiter = pending.lock().remove(&response.id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(response.body);
                            }
                            None => debug!(id = response.id, "Response for unknown request"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed response frame");
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "tdp read failed");
                    break;
                }
                None => {
                    debug!("tdp connection closed by peer");
                    break;
                }
            },
        }
    }

    // Stop accepting new frames before failing the waiters
    drop(outbound);
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
}
