//! blockring Rebalancer
//!
//! Moves blocks held by this node to the peers the ring authorizes to hold
//! them, and reclaims local copies once the transfer is confirmed:
//! - `Rebalancer` examines one bounded batch of local blocks per tick,
//!   pinned to the ring version the pass started under
//! - `RebalanceLoop` drives a rebalancer on its own task
//! - `PeerSender` checks and sends blocks to peers over the protocol registry
//! - `ReclaimGc` deletes marked blocks the ring no longer assigns locally
//! - `Node` assembles all of it into a running daemon

pub mod config;
pub mod gc;
pub mod metrics;
pub mod node;
pub mod rebalancer;
pub mod scheduler;
pub mod sender;

pub use config::{ConfigError, NodeConfig};
pub use gc::{GarbageCollector, ReclaimGc, SweepReport};
pub use node::Node;
pub use rebalancer::{Rebalancer, TickReport};
pub use scheduler::RebalanceLoop;
pub use sender::{CheckAndSender, PeerSender};
