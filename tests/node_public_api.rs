//! Integration tests for the Node public API.
//!
//! These tests exercise the Node facade over real TCP links: binding,
//! bootstrapping into the gossip overlay and view maintenance.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use floodit::{Node, NodeConfig, PeerAddr, PeerSamplingConfig};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> PeerAddr {
    PeerAddr::new("127.0.0.1", next_port())
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_gossip() -> NodeConfig {
    NodeConfig {
        sampling: PeerSamplingConfig {
            gossip_period: Duration::from_millis(100),
            response_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn node_bind_and_local_addr() {
    let addr = test_addr();
    let node = Node::bind(&addr).await.expect("bind failed");
    assert_eq!(node.local_addr(), addr);
    assert!(node.view().await.is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn bind_twice_on_same_port_fails() {
    let addr = test_addr();
    let _first = Node::bind(&addr).await.expect("bind failed");
    assert!(Node::bind(&addr).await.is_err());
}

#[tokio::test]
async fn bootstrap_exchanges_views_both_ways() {
    let a = Node::bind(&test_addr()).await.expect("bind failed");
    let b = Node::bind(&test_addr()).await.expect("bind failed");

    timeout(TEST_TIMEOUT, b.bootstrap(&a.local_addr()))
        .await
        .expect("bootstrap timed out")
        .expect("bootstrap failed");

    assert!(b.view().await.contains(&a.local_addr()));
    timeout(TEST_TIMEOUT, async {
        while !a.view().await.contains(&b.local_addr()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("contact never learned about the joiner");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_to_unreachable_peer_fails() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let nobody = PeerAddr::new("127.0.0.1", next_port());
    let result = timeout(TEST_TIMEOUT, node.bootstrap(&nobody))
        .await
        .expect("bootstrap hung");
    assert!(result.is_err());
    assert!(node.view().await.is_empty());
}

#[tokio::test]
async fn bootstrap_to_silent_peer_times_out() {
    let response_timeout = Duration::from_millis(300);
    let config = NodeConfig {
        sampling: PeerSamplingConfig {
            response_timeout,
            ..Default::default()
        },
        ..Default::default()
    };
    let node = Node::bind_with_config(&test_addr(), config)
        .await
        .expect("bind failed");

    // Accepts connections and reads requests, but never answers.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind failed");
    let contact = PeerAddr::new("127.0.0.1", silent.local_addr().unwrap().port());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let started = tokio::time::Instant::now();
    let result = timeout(TEST_TIMEOUT, node.bootstrap(&contact))
        .await
        .expect("bootstrap hung");
    let elapsed = started.elapsed();

    let err = result.expect_err("bootstrap must fail without a response");
    assert!(format!("{:#}", err).contains("no gossip response"), "{:#}", err);
    assert!(elapsed >= response_timeout);
    assert!(elapsed < response_timeout * 5);
    assert!(node.view().await.is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn gossip_spreads_membership_and_keeps_views_bounded() {
    let config = fast_gossip();
    let max = config.sampling.max_view_size;

    let seed = Node::bind_with_config(&test_addr(), config.clone())
        .await
        .expect("bind failed");
    let mut nodes = Vec::new();
    for _ in 0..14 {
        let node = Node::bind_with_config(&test_addr(), config.clone())
            .await
            .expect("bind failed");
        node.bootstrap(&seed.local_addr()).await.expect("bootstrap failed");
        nodes.push(node);
    }

    // The last joiner only met the seed directly; gossip must bring in others.
    let last = nodes.last().expect("nodes");
    timeout(TEST_TIMEOUT, async {
        loop {
            let view = last.view().await;
            if view.iter().any(|d| d.addr() != seed.local_addr()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("gossip never introduced other peers");

    for node in nodes.iter().chain(std::iter::once(&seed)) {
        let view = node.view().await;
        assert!(view.len() <= max, "view of {} exceeds bound", node.local_addr());
        assert!(!view.contains(&node.local_addr()), "view contains itself");
    }

    for node in &nodes {
        node.shutdown().await;
    }
    seed.shutdown().await;
}
