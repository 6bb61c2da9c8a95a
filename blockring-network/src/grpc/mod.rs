//! gRPC transport behind the `http://` scheme
//!
//! Serves the same [`Rpc`](crate::rpc::Rpc) contract as tdp through a tonic
//! service, `blockring.BlockService`, with one unary method per operation.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{GrpcClient, GrpcDialer};
pub use server::{BlockServiceServer, GrpcListener, GrpcServer};

use crate::registry::ProtocolRegistry;
use blockring_core::BlockRingError;
use std::sync::Arc;
use tonic::{Code, Status};

/// URL scheme served by this transport
pub const SCHEME: &str = "http";

pub const SERVICE: &str = "blockring.BlockService";
pub(crate) const BLOCK_PATH: &str = "/blockring.BlockService/Block";
pub(crate) const PUT_BLOCK_PATH: &str = "/blockring.BlockService/PutBlock";
pub(crate) const REBALANCE_CHECK_PATH: &str = "/blockring.BlockService/RebalanceCheck";

/// Install the gRPC listener and dialer
pub fn register(registry: &mut ProtocolRegistry) {
    registry.register_listener(SCHEME, Arc::new(GrpcListener));
    registry.register_dialer(SCHEME, Arc::new(GrpcDialer));
}

/// Status sent for a serving-side failure
pub(crate) fn to_status(err: &BlockRingError) -> Status {
    match err {
        BlockRingError::BlockNotFound(block) => Status::not_found(block.clone()),
        BlockRingError::Rejected(msg) => Status::failed_precondition(msg.clone()),
        BlockRingError::Storage(_) | BlockRingError::StorageFull { .. } => {
            Status::failed_precondition(err.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}

/// Client-side error for a status returned by the peer
pub(crate) fn from_status(status: Status) -> BlockRingError {
    match status.code() {
        Code::NotFound => BlockRingError::BlockNotFound(status.message().to_string()),
        Code::FailedPrecondition | Code::InvalidArgument => {
            BlockRingError::Rejected(status.message().to_string())
        }
        code => BlockRingError::Transport(format!("peer error ({:?}): {}", code, status.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_error_class() {
        let not_found = from_status(to_status(&BlockRingError::BlockNotFound("b".into())));
        assert!(matches!(not_found, BlockRingError::BlockNotFound(m) if m == "b"));

        let full = from_status(to_status(&BlockRingError::StorageFull {
            used: 10,
            capacity: 10,
        }));
        assert!(matches!(full, BlockRingError::Rejected(_)));

        let internal = from_status(to_status(&BlockRingError::Internal("boom".into())));
        assert!(internal.is_retryable());
    }
}
