//! Multi-node rebalancing over real peer servers on loopback

use blockring_core::{BlockRef, HashRing, Ring, StaticRing, Topology, VolumeId};
use blockring_metadata::{MetadataBackend, TempMetadata};
use blockring_rebalancer::{Node, NodeConfig};
use blockring_storage::{BlockStore, MemoryBlockStore};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

fn config(id: &str, volumes: &[&str]) -> NodeConfig {
    config_on("tdp", id, volumes)
}

fn config_on(scheme: &str, id: &str, volumes: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.id = id.to_string();
    config.node.listen = format!("{}://127.0.0.1:0", scheme);
    config.rebalance.batch_size = 4;
    config.rebalance.tick_interval_ms = 20;
    config.rebalance.sweep_interval_secs = 2;
    config.rebalance.volumes = volumes.iter().map(|v| v.to_string()).collect();
    config
}

/// A node holding `count` blocks of volume "A"
async fn source_node(count: u64) -> (Node, Vec<BlockRef>) {
    source_node_on("tdp", count).await
}

async fn source_node_on(scheme: &str, count: u64) -> (Node, Vec<BlockRef>) {
    let metadata: Arc<dyn MetadataBackend> = Arc::new(TempMetadata::new());
    let volume: VolumeId = metadata.create_volume("A", 4096).await.unwrap().id;

    let store = Arc::new(MemoryBlockStore::new());
    let blocks: Vec<BlockRef> = (0..count)
        .map(|i| {
            let block = BlockRef::new(volume, 7, i);
            store
                .write_block(block, Bytes::from(format!("block-{}", i)))
                .unwrap();
            block
        })
        .collect();

    let node = Node::start_with(config_on(scheme, "n1", &["A"]), store, metadata)
        .await
        .unwrap();
    (node, blocks)
}

async fn empty_node(id: &str) -> Node {
    empty_node_on("tdp", id).await
}

async fn empty_node_on(scheme: &str, id: &str) -> Node {
    Node::start_with(
        config_on(scheme, id, &[]),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(TempMetadata::new()),
    )
    .await
    .unwrap()
}

fn url(node: &Node) -> blockring_network::PeerUrl {
    url_on("tdp", node)
}

fn url_on(scheme: &str, node: &Node) -> blockring_network::PeerUrl {
    format!("{}://{}", scheme, node.local_addr()).parse().unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocks_converge_on_new_holders() {
    let (n1, blocks) = source_node(12).await;
    let n2 = empty_node("n2").await;
    let n3 = empty_node("n3").await;

    n1.sender().update_peer("n2", url(&n2));
    n1.sender().update_peer("n3", url(&n3));

    // Only n1 in the ring so far: nothing moves
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(n2.store().num_blocks().unwrap(), 0);

    let ring = Arc::new(HashRing::new(
        2,
        vec!["n2".to_string(), "n3".to_string()],
        1,
    ));
    n1.topology().set_ring(ring.clone()).unwrap();

    let converged = wait_for(|| n1.store().num_blocks().unwrap() == 0).await;
    assert!(converged, "source node still holds blocks");

    for block in &blocks {
        let holder = &ring.lookup(block).unwrap()[0];
        let store = if holder == "n2" { n2.store() } else { n3.store() };
        let data = store.get_block(block).unwrap().expect("block on its holder");
        assert_eq!(data, Bytes::from(format!("block-{}", block.index)));
    }
    assert_eq!(
        n2.store().num_blocks().unwrap() + n3.store().num_blocks().unwrap(),
        12
    );

    n1.shutdown().await;
    n2.shutdown().await;
    n3.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nothing_deleted_without_confirmed_transfer() {
    let (n1, blocks) = source_node(6).await;

    // The only authorized holder never answers
    n1.sender()
        .update_peer("ghost", "tdp://127.0.0.1:1".parse().unwrap());
    n1.topology()
        .set_ring(Arc::new(StaticRing::new(2, vec!["ghost".to_string()])))
        .unwrap();

    // Several ticks and at least one sweep
    tokio::time::sleep(Duration::from_millis(2500)).await;
    for block in &blocks {
        assert!(n1.store().has_block(block).unwrap());
    }

    n1.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_moving_back_keeps_local_copy() {
    let (n1, blocks) = source_node(4).await;
    let n2 = empty_node("n2").await;
    n1.sender().update_peer("n2", url(&n2));

    n1.topology()
        .set_ring(Arc::new(StaticRing::new(2, vec!["n2".to_string()])))
        .unwrap();
    let copied = wait_for(|| n2.store().num_blocks().unwrap() == 4).await;
    assert!(copied);

    // Before the next sweep, the ring hands the blocks back to n1
    n1.topology()
        .set_ring(Arc::new(StaticRing::new(
            3,
            vec!["n1".to_string(), "n2".to_string()],
        )))
        .unwrap();
    assert_eq!(n1.topology().ring().version(), 3);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    for block in &blocks {
        assert!(n1.store().has_block(block).unwrap());
    }

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocks_move_over_grpc() {
    let (n1, blocks) = source_node_on("http", 5).await;
    let n2 = empty_node_on("http", "n2").await;
    n1.sender().update_peer("n2", url_on("http", &n2));

    n1.topology()
        .set_ring(Arc::new(StaticRing::new(2, vec!["n2".to_string()])))
        .unwrap();

    let copied = wait_for(|| n2.store().num_blocks().unwrap() == 5).await;
    assert!(copied, "blocks did not reach n2 over gRPC");
    for block in &blocks {
        let data = n2.store().get_block(block).unwrap().expect("block on n2");
        assert_eq!(data, Bytes::from(format!("block-{}", block.index)));
    }

    n1.shutdown().await;
    n2.shutdown().await;
}
