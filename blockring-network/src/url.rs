//! Peer URLs of the form `scheme://host[:port]`

use blockring_core::{BlockRingError, Result, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of a peer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl PeerUrl {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host:port`, filling in the well-known port when none was given
    pub fn address_with_default(&self) -> String {
        self.address(self.port.unwrap_or(DEFAULT_PORT))
    }

    fn address(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl FromStr for PeerUrl {
    type Err = BlockRingError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BlockRingError::InvalidUrl(s.to_string());

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let authority = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .and_then(|p| p.parse::<u16>().ok())
                        .ok_or_else(invalid)?,
                ),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
                None => (authority, None),
            }
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        Ok(Self::new(scheme, host, port))
    }
}

impl TryFrom<String> for PeerUrl {
    type Error = BlockRingError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeerUrl> for String {
    fn from(url: PeerUrl) -> Self {
        url.to_string()
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}", self.scheme, self.address(port)),
            None if self.host.contains(':') => write!(f, "{}://[{}]", self.scheme, self.host),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only_gets_default_port() {
        let url: PeerUrl = "tdp://node-a".parse().unwrap();
        assert_eq!(url.scheme(), "tdp");
        assert_eq!(url.port(), None);
        assert_eq!(url.address_with_default(), "node-a:40000");
    }

    #[test]
    fn test_explicit_port_passes_through() {
        let url: PeerUrl = "tdp://10.0.0.2:7000".parse().unwrap();
        assert_eq!(url.address_with_default(), "10.0.0.2:7000");
        assert_eq!(url.to_string(), "tdp://10.0.0.2:7000");
    }

    #[test]
    fn test_ipv6() {
        let url: PeerUrl = "tdp://[::1]:9000".parse().unwrap();
        assert_eq!(url.host(), "::1");
        assert_eq!(url.address_with_default(), "[::1]:9000");

        let bare: PeerUrl = "tdp://[fe80::1]".parse().unwrap();
        assert_eq!(bare.address_with_default(), "[fe80::1]:40000");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["node-a", "://host", "tdp://", "tdp://host:notaport", "tdp://[::1"] {
            assert!(
                matches!(bad.parse::<PeerUrl>(), Err(BlockRingError::InvalidUrl(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
