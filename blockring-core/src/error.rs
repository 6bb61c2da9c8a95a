//! Error types for blockring
//!
//! Provides a unified error type for all blockring operations.

use thiserror::Error;

/// Result type alias for blockring operations
pub type Result<T> = std::result::Result<T, BlockRingError>;

/// Unified error type for blockring
#[derive(Error, Debug)]
pub enum BlockRingError {
    // ===== Domain Errors =====
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // ===== Lease Errors =====
    #[error("Volume {volume} is locked by lease {holder}")]
    AlreadyLocked { volume: String, holder: i64 },

    #[error("Volume {0} is not locked by this session")]
    NotLocked(String),

    // ===== Transport Errors =====
    #[error("Unknown transport scheme: {0}")]
    UnknownScheme(String),

    #[error("Invalid peer URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    Closed,

    #[error("Request rejected by peer: {0}")]
    Rejected(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage full: {used} / {capacity} bytes")]
    StorageFull { used: u64, capacity: u64 },

    // ===== Placement Errors =====
    #[error("Ring error: {0}")]
    Ring(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockRingError {
    /// Peer-side failures that a later attempt may get past
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlockRingError::Transport(_) | BlockRingError::Closed | BlockRingError::Io(_)
        )
    }

    /// Failures of the local block store; these end a rebalance session
    pub fn is_fatal_local(&self) -> bool {
        matches!(
            self,
            BlockRingError::Storage(_) | BlockRingError::StorageFull { .. }
        )
    }
}

impl From<bincode::Error> for BlockRingError {
    fn from(err: bincode::Error) -> Self {
        BlockRingError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BlockRingError::AlreadyLocked {
            volume: "vol-a".to_string(),
            holder: 42,
        };
        assert_eq!(err.to_string(), "Volume vol-a is locked by lease 42");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: BlockRingError = io_err.into();
        assert!(matches!(err, BlockRingError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_classes() {
        assert!(BlockRingError::Transport("dial".into()).is_retryable());
        assert!(BlockRingError::Closed.is_retryable());
        assert!(!BlockRingError::Storage("disk".into()).is_retryable());
        assert!(BlockRingError::Storage("disk".into()).is_fatal_local());
        assert!(!BlockRingError::NotLocked("v".into()).is_fatal_local());
    }
}
