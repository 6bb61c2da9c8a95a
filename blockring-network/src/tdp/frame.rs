//! tdp wire format
//!
//! Every frame is a 4-byte big-endian length followed by a bincode body.
//! Requests and responses carry an id so calls multiplex over one
//! connection and may complete out of order.

use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Headroom above the block payload for refs and framing
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Blocks that fit in one put batch
pub const MAX_BATCH_BLOCKS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub body: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Block { block: BlockRef },
    PutBlock { refs: Vec<BlockRef>, blocks: Vec<Bytes> },
    RebalanceCheck { refs: Vec<BlockRef> },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Block { .. } => "block",
            Request::PutBlock { .. } => "put_block",
            Request::RebalanceCheck { .. } => "rebalance_check",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub body: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Block { data: Bytes },
    Put,
    Check { valid: Vec<bool> },
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Rejected,
    Internal,
}

impl Response {
    /// Wire form of a serving-side failure
    pub fn error(err: &BlockRingError) -> Self {
        let (kind, message) = match err {
            BlockRingError::BlockNotFound(block) => (ErrorKind::NotFound, block.clone()),
            BlockRingError::Rejected(msg) => (ErrorKind::Rejected, msg.clone()),
            BlockRingError::Storage(_) | BlockRingError::StorageFull { .. } => {
                (ErrorKind::Rejected, err.to_string())
            }
            other => (ErrorKind::Internal, other.to_string()),
        };
        Response::Error { kind, message }
    }
}

impl ErrorKind {
    /// Client-side error for a failure reported by the peer
    pub fn into_error(self, message: String) -> BlockRingError {
        match self {
            ErrorKind::NotFound => BlockRingError::BlockNotFound(message),
            ErrorKind::Rejected => BlockRingError::Rejected(message),
            ErrorKind::Internal => BlockRingError::Transport(format!("peer error: {}", message)),
        }
    }
}

/// Largest frame either side accepts for the given block size
pub fn max_frame_length(global: &GlobalMetadata) -> usize {
    (global.block_size as usize)
        .saturating_mul(MAX_BATCH_BLOCKS)
        .saturating_add(FRAME_OVERHEAD)
}

pub fn codec(global: &GlobalMetadata) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length(global))
        .new_codec()
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(frame)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockring_core::VolumeId;

    #[test]
    fn test_frame_length_tracks_block_size() {
        let global = GlobalMetadata {
            block_size: 4096,
            replication: 2,
        };
        assert_eq!(max_frame_length(&global), 4096 * 64 + 64 * 1024);
    }

    #[test]
    fn test_error_kinds() {
        let not_found = Response::error(&BlockRingError::BlockNotFound("1:1:1".into()));
        match not_found {
            Response::Error { kind, message } => {
                let err = kind.into_error(message);
                assert!(matches!(err, BlockRingError::BlockNotFound(ref s) if s == "1:1:1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let full = Response::error(&BlockRingError::StorageFull {
            used: 10,
            capacity: 10,
        });
        assert!(matches!(
            full,
            Response::Error {
                kind: ErrorKind::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn test_put_frame_decodes() {
        let block = BlockRef::new(VolumeId(4), 2, 9);
        let frame = RequestFrame {
            id: 17,
            body: Request::PutBlock {
                refs: vec![block],
                blocks: vec![Bytes::from_static(b"payload")],
            },
        };
        let decoded: RequestFrame = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded.id, 17);
        match decoded.body {
            Request::PutBlock { refs, blocks } => {
                assert_eq!(refs, vec![block]);
                assert_eq!(blocks[0], Bytes::from_static(b"payload"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
