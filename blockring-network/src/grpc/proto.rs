//! Wire messages of `blockring.BlockService`
//!
//! ```text
//! message BlockRef { uint64 volume = 1; uint64 inode = 2; uint64 index = 3; }
//!
//! message BlockRequest { BlockRef block = 1; }
//! message BlockResponse { bytes data = 1; }
//! message PutBlockRequest { repeated BlockRef refs = 1; repeated bytes blocks = 2; }
//! message PutBlockResponse {}
//! message RebalanceCheckRequest { repeated BlockRef refs = 1; }
//! message RebalanceCheckResponse { repeated bool valid = 1; }
//! ```

use blockring_core::{BlockRef, VolumeId};
use bytes::Bytes;

#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct BlockRefMessage {
    #[prost(uint64, tag = "1")]
    pub volume: u64,
    #[prost(uint64, tag = "2")]
    pub inode: u64,
    #[prost(uint64, tag = "3")]
    pub index: u64,
}

impl From<BlockRef> for BlockRefMessage {
    fn from(block: BlockRef) -> Self {
        Self {
            volume: block.volume.0,
            inode: block.inode,
            index: block.index,
        }
    }
}

impl From<BlockRefMessage> for BlockRef {
    fn from(message: BlockRefMessage) -> Self {
        BlockRef::new(VolumeId(message.volume), message.inode, message.index)
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockRequest {
    #[prost(message, optional, tag = "1")]
    pub block: Option<BlockRefMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutBlockRequest {
    #[prost(message, repeated, tag = "1")]
    pub refs: Vec<BlockRefMessage>,
    #[prost(bytes = "bytes", repeated, tag = "2")]
    pub blocks: Vec<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutBlockResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RebalanceCheckRequest {
    #[prost(message, repeated, tag = "1")]
    pub refs: Vec<BlockRefMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RebalanceCheckResponse {
    #[prost(bool, repeated, tag = "1")]
    pub valid: Vec<bool>,
}

pub fn to_messages(refs: Vec<BlockRef>) -> Vec<BlockRefMessage> {
    refs.into_iter().map(BlockRefMessage::from).collect()
}

pub fn from_messages(refs: Vec<BlockRefMessage>) -> Vec<BlockRef> {
    refs.into_iter().map(BlockRef::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_put_request_decodes_refs_and_payloads() {
        let refs = vec![
            BlockRef::new(VolumeId(3), 1, 0),
            BlockRef::new(VolumeId(3), 1, u64::MAX),
        ];
        let request = PutBlockRequest {
            refs: to_messages(refs.clone()),
            blocks: vec![Bytes::from_static(b"a"), Bytes::new()],
        };

        let decoded = PutBlockRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(from_messages(decoded.refs), refs);
        assert_eq!(decoded.blocks, vec![Bytes::from_static(b"a"), Bytes::new()]);
    }

    #[test]
    fn test_missing_block_ref_decodes_as_none() {
        let decoded = BlockRequest::decode(&[][..]).unwrap();
        assert!(decoded.block.is_none());
    }
}
