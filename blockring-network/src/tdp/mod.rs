//! tdp: length-prefixed framed RPC over TCP
//!
//! The reference transport behind the `tdp://` scheme.

pub mod client;
pub mod frame;
pub mod server;

pub use client::{TdpClient, TdpDialer};
pub use server::{TdpListener, TdpServer};

use crate::registry::ProtocolRegistry;
use std::sync::Arc;

/// URL scheme served by this transport
pub const SCHEME: &str = "tdp";

/// Install the tdp listener and dialer
pub fn register(registry: &mut ProtocolRegistry) {
    registry.register_listener(SCHEME, Arc::new(TdpListener));
    registry.register_dialer(SCHEME, Arc::new(TdpDialer));
}
