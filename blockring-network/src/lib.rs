//! blockring Network Layer
//!
//! How peers talk to each other while blocks move between them:
//! - **`ProtocolRegistry`**: scheme → listener/dialer, built once at startup
//! - **`Rpc`**: the block contract (`block`, `put_block`, `rebalance_check`)
//! - **`StoreHandler`**: serves the contract from a local `BlockStore`
//! - **tdp**: length-prefixed framed RPC over TCP, the reference transport
//! - **grpc**: the same contract as a tonic service under `http://`
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐  dial(tdp://peer)  ┌──────────────┐
//!   │  TdpClient   │ ─────────────────▶ │  TdpServer   │
//!   │ (RpcClient)  │ ◀── framed bincode │ (RpcServer)  │
//!   └──────────────┘                    └──────┬───────┘
//!                                              │ Arc<dyn Rpc>
//!                                       ┌──────┴───────┐
//!                                       │ StoreHandler │
//!                                       └──────┬───────┘
//!                                              │
//!                                         BlockStore
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use blockring_network::{PeerUrl, ProtocolRegistry, StoreHandler};
//!
//! let registry = ProtocolRegistry::with_defaults();
//! let url: PeerUrl = "tdp://0.0.0.0".parse()?;
//! let server = registry.listen(&url, Arc::new(StoreHandler::new(store, "node-a")), global).await?;
//!
//! let peer = registry.dial(&"tdp://node-b".parse()?, Duration::from_secs(5), global).await?;
//! let held = peer.rebalance_check(refs).await?;
//! ```

pub mod grpc;
pub mod handler;
pub mod registry;
pub mod rpc;
pub mod tdp;
pub mod url;

pub use handler::StoreHandler;
pub use registry::ProtocolRegistry;
pub use rpc::{Dialer, Listener, Rpc, RpcClient, RpcServer};
pub use url::PeerUrl;
