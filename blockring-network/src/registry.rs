//! Transport registry keyed by URL scheme
//!
//! Built once at the composition root, filled with `register_*` while it is
//! still exclusively owned, then shared read-only.

use crate::rpc::{Dialer, Listener, Rpc, RpcClient, RpcServer};
use crate::{grpc, tdp};
use crate::url::PeerUrl;
use blockring_core::{BlockRingError, GlobalMetadata, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    listeners: HashMap<String, Arc<dyn Listener>>,
    dialers: HashMap<String, Arc<dyn Dialer>>,
}

impl ProtocolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in transport
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        tdp::register(&mut registry);
        grpc::register(&mut registry);
        registry
    }

    /// Register the listener for `scheme`, replacing any earlier one
    pub fn register_listener(&mut self, scheme: impl Into<String>, listener: Arc<dyn Listener>) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Registered listener");
        self.listeners.insert(scheme, listener);
    }

    /// Register the dialer for `scheme`, replacing any earlier one
    pub fn register_dialer(&mut self, scheme: impl Into<String>, dialer: Arc<dyn Dialer>) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Registered dialer");
        self.dialers.insert(scheme, dialer);
    }

    /// Schemes that can be dialed
    pub fn dial_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.dialers.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Start serving `handler` at `url`
    pub async fn listen(
        &self,
        url: &PeerUrl,
        handler: Arc<dyn Rpc>,
        global: GlobalMetadata,
    ) -> Result<Box<dyn RpcServer>> {
        let listener = self
            .listeners
            .get(url.scheme())
            .ok_or_else(|| BlockRingError::UnknownScheme(url.scheme().to_string()))?;

        let server = listener
            .listen(&url.address_with_default(), handler, global)
            .await?;
        info!(url = %url, addr = %server.local_addr(), "Listening for peers");
        Ok(server)
    }

    /// Open a client connection to `url`
    pub async fn dial(
        &self,
        url: &PeerUrl,
        timeout: Duration,
        global: GlobalMetadata,
    ) -> Result<Arc<dyn RpcClient>> {
        let dialer = self
            .dialers
            .get(url.scheme())
            .ok_or_else(|| BlockRingError::UnknownScheme(url.scheme().to_string()))?;

        dialer
            .dial(&url.address_with_default(), timeout, global)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records the address it was asked to dial, then fails
    struct RecordingDialer {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(
            &self,
            addr: &str,
            _timeout: Duration,
            _global: GlobalMetadata,
        ) -> Result<Arc<dyn RpcClient>> {
            self.seen.lock().push(addr.to_string());
            Err(BlockRingError::Transport("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let registry = ProtocolRegistry::with_defaults();
        let url: PeerUrl = "carrier-pigeon://node-a".parse().unwrap();

        let result = registry
            .dial(&url, Duration::from_secs(1), GlobalMetadata::default())
            .await;
        assert!(matches!(result, Err(BlockRingError::UnknownScheme(s)) if s == "carrier-pigeon"));
    }

    #[tokio::test]
    async fn test_default_port_applied_on_dial() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProtocolRegistry::new();
        registry.register_dialer("rec", Arc::new(RecordingDialer { seen: seen.clone() }));

        for url in ["rec://host-a", "rec://host-b:7000"] {
            let url: PeerUrl = url.parse().unwrap();
            let _ = registry
                .dial(&url, Duration::from_secs(1), GlobalMetadata::default())
                .await;
        }
        assert_eq!(*seen.lock(), vec!["host-a:40000", "host-b:7000"]);
    }

    #[test]
    fn test_last_registration_wins() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProtocolRegistry::new();
        registry.register_dialer("rec", Arc::new(RecordingDialer { seen: first }));
        registry.register_dialer("rec", Arc::new(RecordingDialer { seen: second.clone() }));

        assert_eq!(registry.dial_schemes(), vec!["rec"]);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let url: PeerUrl = "rec://x".parse().unwrap();
        let _ = rt.block_on(registry.dial(&url, Duration::from_secs(1), GlobalMetadata::default()));
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_defaults_include_every_transport() {
        assert_eq!(
            ProtocolRegistry::with_defaults().dial_schemes(),
            vec!["http", "tdp"]
        );
    }
}
