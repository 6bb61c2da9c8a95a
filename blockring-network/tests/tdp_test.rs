//! tdp transport end to end on loopback

use blockring_core::{BlockRef, BlockRingError, GlobalMetadata, VolumeId};
use blockring_network::tdp::TdpClient;
use blockring_network::{PeerUrl, ProtocolRegistry, Rpc, RpcClient, RpcServer, StoreHandler};
use blockring_storage::{BlockStore, MemoryBlockStore};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

fn block(index: u64) -> BlockRef {
    BlockRef::new(VolumeId(7), 1, index)
}

fn global() -> GlobalMetadata {
    GlobalMetadata {
        block_size: 4096,
        replication: 2,
    }
}

async fn start_server(
    store: Arc<MemoryBlockStore>,
) -> (ProtocolRegistry, Box<dyn RpcServer>, PeerUrl) {
    let registry = ProtocolRegistry::with_defaults();
    let listen: PeerUrl = "tdp://127.0.0.1:0".parse().unwrap();
    let server = registry
        .listen(&listen, Arc::new(StoreHandler::new(store, "server")), global())
        .await
        .unwrap();
    let url: PeerUrl = format!("tdp://{}", server.local_addr()).parse().unwrap();
    (registry, server, url)
}

#[tokio::test]
async fn test_put_then_get() {
    let store = Arc::new(MemoryBlockStore::new());
    let (registry, server, url) = start_server(store.clone()).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    let data = Bytes::from(vec![0xAB; 4096]);
    client.put_block(block(1), data.clone()).await.unwrap();
    assert_eq!(client.block(block(1)).await.unwrap(), data);
    assert!(store.has_block(&block(1)).unwrap());

    let missing = client.block(block(2)).await;
    assert!(matches!(missing, Err(BlockRingError::BlockNotFound(_))));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_check_is_positional() {
    let store = Arc::new(MemoryBlockStore::new());
    store.write_block(block(1), Bytes::from_static(b"a")).unwrap();
    store.write_block(block(3), Bytes::from_static(b"c")).unwrap();
    let (registry, server, url) = start_server(store).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    let valid = client
        .rebalance_check(vec![block(1), block(2), block(3)])
        .await
        .unwrap();
    assert_eq!(valid, vec![true, false, true]);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_share_connection() {
    let store = Arc::new(MemoryBlockStore::new());
    let (registry, server, url) = start_server(store.clone()).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let data = Bytes::from(i.to_be_bytes().to_vec());
            client.put_block(block(i), data.clone()).await.unwrap();
            assert_eq!(client.block(block(i)).await.unwrap(), data);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(store.num_blocks().unwrap(), 32);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_put() {
    let store = Arc::new(MemoryBlockStore::new());
    let (registry, server, url) = start_server(store.clone()).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    client
        .put_blocks(
            vec![block(1), block(2)],
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
        )
        .await
        .unwrap();
    assert_eq!(store.num_blocks().unwrap(), 2);

    let mismatched = client
        .put_blocks(vec![block(3)], vec![])
        .await;
    assert!(matches!(mismatched, Err(BlockRingError::Rejected(_))));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_aborts_on_first_failure() {
    // Room for exactly one block
    let store = Arc::new(MemoryBlockStore::with_capacity(4));
    let (registry, server, url) = start_server(store.clone()).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    let result = client
        .put_blocks(
            vec![block(1), block(2), block(3)],
            vec![
                Bytes::from_static(b"1111"),
                Bytes::from_static(b"2222"),
                Bytes::from_static(b"3333"),
            ],
        )
        .await;
    assert!(matches!(result, Err(BlockRingError::Rejected(_))));
    assert!(store.has_block(&block(1)).unwrap());
    assert!(!store.has_block(&block(3)).unwrap());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_client_fails() {
    let store = Arc::new(MemoryBlockStore::new());
    let (registry, server, url) = start_server(store).await;
    let client = registry.dial(&url, DIAL_TIMEOUT, global()).await.unwrap();

    client.close().await.unwrap();
    let result = client.block(block(1)).await;
    assert!(matches!(result, Err(BlockRingError::Closed)));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_server_close_severs_clients() {
    let store = Arc::new(MemoryBlockStore::new());
    let (_registry, server, _url) = start_server(store).await;
    let client = TdpClient::connect(&server.local_addr().to_string(), DIAL_TIMEOUT, global())
        .await
        .unwrap();
    client
        .rebalance_check(vec![block(1)])
        .await
        .unwrap();

    server.close().await.unwrap();

    // The connection task notices the reset shortly after
    let mut failed = false;
    for _ in 0..50 {
        if client.rebalance_check(vec![block(1)]).await.is_err() {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failed, "calls should fail once the server is closed");
}

#[tokio::test]
async fn test_dial_refused() {
    let registry = ProtocolRegistry::with_defaults();
    // Bind then drop to get a port with nothing listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url: PeerUrl = format!("tdp://127.0.0.1:{}", port).parse().unwrap();

    let result = registry.dial(&url, DIAL_TIMEOUT, global()).await;
    assert!(matches!(result, Err(BlockRingError::Transport(_))));
}
