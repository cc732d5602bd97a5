//! Integration tests for the relay infrastructure.
//!
//! These tests run a relay hub and causal broadcast clients over real TCP
//! connections, validating delivery, history replay and membership events.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_infrastructure -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use floodit::{
    BroadcastConfig, BroadcastEvent, CausalBroadcast, Delivery, HubConfig, PeerAddr, RelayGroup,
    RelayHub,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_millis(500);

async fn start_hub() -> RelayHub {
    init_tracing();
    RelayHub::bind(&PeerAddr::new("127.0.0.1", 0), HubConfig::default())
        .await
        .expect("hub bind failed")
}

async fn client(
    hub: &RelayHub,
    name: &str,
    document: &str,
) -> (CausalBroadcast, mpsc::Receiver<BroadcastEvent>) {
    let relay = RelayGroup::connect(&hub.local_addr(), name, document)
        .await
        .expect("connect failed");
    CausalBroadcast::spawn(Arc::new(relay), BroadcastConfig::default())
        .await
        .expect("spawn failed")
}

async fn next_event(rx: &mut mpsc::Receiver<BroadcastEvent>) -> BroadcastEvent {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn wait_ready(rx: &mut mpsc::Receiver<BroadcastEvent>) -> String {
    loop {
        match next_event(rx).await {
            BroadcastEvent::Ready { id, .. } => return id,
            BroadcastEvent::JoinFailed(reason) => panic!("join failed: {}", reason),
            _ => {}
        }
    }
}

async fn next_remote_delivery(rx: &mut mpsc::Receiver<BroadcastEvent>) -> Delivery {
    loop {
        if let BroadcastEvent::Deliver(d) = next_event(rx).await
            && !d.local
        {
            return d;
        }
    }
}

async fn publish(group: &CausalBroadcast, msg: Value) {
    group.local_send(msg.clone()).await.expect("local_send failed");
    group.send(msg).await.expect("send failed");
}

#[tokio::test]
async fn second_client_receives_first_clients_message() {
    let hub = start_hub().await;
    let (alice, mut alice_events) = client(&hub, "alice", "notes").await;
    wait_ready(&mut alice_events).await;
    let (_bob, mut bob_events) = client(&hub, "bob", "notes").await;
    wait_ready(&mut bob_events).await;

    publish(&alice, json!("a")).await;

    let delivered = next_remote_delivery(&mut bob_events).await;
    assert_eq!(delivered.msg, json!("a"));
    assert!(!delivered.error);
    assert_eq!(delivered.entries.len(), 5);

    // The sender never gets its own message back from the hub.
    assert!(timeout(SHORT_TIMEOUT, next_remote_delivery(&mut alice_events)).await.is_err());
}

#[tokio::test]
async fn late_joiner_replays_history_in_causal_order() {
    let hub = start_hub().await;
    let (alice, mut alice_events) = client(&hub, "alice", "doc").await;
    wait_ready(&mut alice_events).await;

    for i in 0..10 {
        publish(&alice, json!(i)).await;
    }
    timeout(TEST_TIMEOUT, async {
        while hub.documents().await.first().map(|d| d.history) != Some(10) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("history not recorded");

    let (_carol, mut carol_events) = client(&hub, "carol", "doc").await;
    for i in 0..10 {
        let d = next_remote_delivery(&mut carol_events).await;
        assert_eq!(d.msg, json!(i));
        assert!(!d.error);
    }
}

#[tokio::test]
async fn member_events_follow_connections() {
    let hub = start_hub().await;
    let (_alice, mut alice_events) = client(&hub, "alice", "doc").await;
    wait_ready(&mut alice_events).await;

    let (bob, mut bob_events) = client(&hub, "bob", "doc").await;
    let bob_id = wait_ready(&mut bob_events).await;

    match next_event(&mut alice_events).await {
        BroadcastEvent::MemberJoined(member) => {
            assert_eq!(member.id, bob_id);
            assert_eq!(member.name.as_deref(), Some("bob"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    bob.quit().await.expect("quit failed");
    match next_event(&mut alice_events).await {
        BroadcastEvent::MemberLeft(id) => assert_eq!(id, bob_id),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn ids_are_unique_and_documents_close_when_empty() {
    let hub = start_hub().await;
    let (a, mut a_events) = client(&hub, "a", "doc").await;
    let (b, mut b_events) = client(&hub, "b", "doc").await;
    let id_a = wait_ready(&mut a_events).await;
    let id_b = wait_ready(&mut b_events).await;
    assert_ne!(id_a, id_b);

    a.quit().await.expect("quit failed");
    b.quit().await.expect("quit failed");
    timeout(TEST_TIMEOUT, async {
        while !hub.documents().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("document never closed");
}

#[tokio::test]
async fn unreachable_hub_fails_to_connect() {
    let hub = start_hub().await;
    let addr = hub.local_addr();
    hub.shutdown().await;
    drop(hub);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(RelayGroup::connect(&addr, "x", "doc").await.is_err());
}
