//! Integration tests for end-to-end pod synchronization.
//!
//! These tests start a real server and connect real clients, verifying the
//! full write → commit → broadcast → merge pipeline.

use podsync::client::{ClientConfig, ClientError, PodClient, SyncEvent};
use podsync::model::MemberProfile;
use podsync::protocol::{ChangeEvent, WireError};
use podsync::reconciler::MergeOutcome;
use podsync::server::{PodServer, ServerConfig};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        attach_timeout_ms: 2_000,
        storage_path: None,
    };
    let server = PodServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn test_profile(name: &str) -> MemberProfile {
    MemberProfile::new(Uuid::new_v4(), name.to_string(), format!("{name}.png"))
}

/// Connect a client and swallow its `Connected` event.
async fn connected_client(name: &str, port: u16) -> (PodClient, mpsc::Receiver<SyncEvent>) {
    let config = ClientConfig {
        request_timeout: Duration::from_secs(3),
        ..ClientConfig::default()
    };
    let mut client =
        PodClient::with_config(test_profile(name), format!("ws://127.0.0.1:{port}"), config);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

/// Wait for the next remote change, skipping lifecycle events.
async fn next_change(events: &mut mpsc::Receiver<SyncEvent>) -> (ChangeEvent, MergeOutcome) {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::RemoteChange { event, outcome })) => return (event, outcome),
            Ok(Some(_)) => continue,
            other => panic!("Expected RemoteChange, got {other:?}"),
        }
    }
}

/// Assert that no remote change arrives within a short window.
async fn assert_silent(events: &mut mpsc::Receiver<SyncEvent>) {
    if let Ok(Some(SyncEvent::RemoteChange { event, .. })) =
        timeout(Duration::from_millis(150), events.recv()).await
    {
        panic!("Expected silence, got {event:?}");
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_groceries_lifecycle() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connected_client("Alice", port).await;
    let (bob, mut bob_events) = connected_client("Bob", port).await;

    // Alice creates the pod and attaches to it
    let pod = alice.create_pod("Groceries").await.unwrap();
    assert_eq!(pod.name, "Groceries");
    assert_eq!(pod.invite_code.len(), 6);
    assert_eq!(pod.members.len(), 1);
    alice.attach(pod.id).await.unwrap();

    // Bob joins via the invite code and attaches
    let joined = bob.join_pod(&pod.invite_code).await.unwrap();
    assert_eq!(joined.id, pod.id);
    assert_eq!(joined.members.len(), 2);
    bob.attach(pod.id).await.unwrap();

    // Alice sees Bob arrive
    let (event, outcome) = next_change(&mut alice_events).await;
    match event {
        ChangeEvent::MemberJoined { member, .. } => assert_eq!(member.id, bob.profile().id),
        other => panic!("Expected MemberJoined, got {other:?}"),
    }
    assert_eq!(outcome, MergeOutcome::Applied);

    // Alice adds milk; Bob sees it
    let milk = alice.add_item(pod.id, "milk", "Milk", 2.49).await.unwrap();
    assert_eq!(milk.quantity, 1);
    let (event, _) = next_change(&mut bob_events).await;
    match event {
        ChangeEvent::ItemAdded { ref item, .. } => assert_eq!(item.id, milk.id),
        other => panic!("Expected ItemAdded, got {other:?}"),
    }

    // Bob adds the same product: one row, quantity 2
    let milk_again = bob.add_item(pod.id, "milk", "Milk", 2.49).await.unwrap();
    assert_eq!(milk_again.id, milk.id);
    assert_eq!(milk_again.quantity, 2);
    let (event, _) = next_change(&mut alice_events).await;
    match event {
        ChangeEvent::ItemUpdated { ref item, .. } => assert_eq!(item.quantity, 2),
        other => panic!("Expected ItemUpdated, got {other:?}"),
    }

    // Bob bumps the quantity to 5
    let bumped = bob.set_item_quantity(milk.id, 5).await.unwrap();
    assert_eq!(bumped.unwrap().quantity, 5);
    let (event, _) = next_change(&mut alice_events).await;
    match event {
        ChangeEvent::ItemUpdated { ref item, .. } => assert_eq!(item.quantity, 5),
        other => panic!("Expected ItemUpdated, got {other:?}"),
    }
    assert_eq!(alice.cart_totals(pod.id).await, Some((5, 5.0 * 2.49)));

    // Alice removes the item; both local views empty out
    alice.remove_item(milk.id).await.unwrap();
    let (event, _) = next_change(&mut bob_events).await;
    match event {
        ChangeEvent::ItemRemoved { item_id, .. } => assert_eq!(item_id, milk.id),
        other => panic!("Expected ItemRemoved, got {other:?}"),
    }
    assert!(alice.pod(pod.id).await.unwrap().items.is_empty());
    assert!(bob.pod(pod.id).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn test_concurrent_adds_one_row() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Race").await.unwrap();
    bob.join_pod(&pod.invite_code).await.unwrap();
    alice.attach(pod.id).await.unwrap();
    bob.attach(pod.id).await.unwrap();

    // Both add bread at the same time
    let (a, b) = tokio::join!(
        alice.add_item(pod.id, "bread", "Bread", 3.25),
        bob.add_item(pod.id, "bread", "Bread", 3.25),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.id, b.id, "Both writes landed on one row");

    // Let both broadcasts finish merging before comparing views
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The authoritative state has exactly one bread row, quantity 2
    let authoritative = alice.fetch_pod(pod.id).await.unwrap();
    assert_eq!(authoritative.items.len(), 1);
    assert_eq!(authoritative.items[0].product_id, "bread");
    assert_eq!(authoritative.items[0].quantity, 2);

    // Each local view holds a single row; a re-fetch settles any
    // delivery-order wobble in the quantity
    assert_eq!(alice.pod(pod.id).await.unwrap().items.len(), 1);
    assert_eq!(bob.pod(pod.id).await.unwrap().items.len(), 1);
    let refetched = bob.fetch_pod(pod.id).await.unwrap();
    assert_eq!(refetched, authoritative);
    assert_eq!(bob.pod(pod.id).await.unwrap(), refetched);
}

#[tokio::test]
async fn test_own_events_are_skipped() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connected_client("Alice", port).await;
    let (bob, mut bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Echo").await.unwrap();
    // Bob joins before anyone is attached, so no MemberJoined lingers
    bob.join_pod(&pod.invite_code).await.unwrap();
    alice.attach(pod.id).await.unwrap();
    bob.attach(pod.id).await.unwrap();

    let item = alice.add_item(pod.id, "eggs", "Eggs", 4.10).await.unwrap();

    // Bob gets the broadcast; Alice only has her direct reply
    let (event, _) = next_change(&mut bob_events).await;
    match event {
        ChangeEvent::ItemAdded { item: ref added, .. } => assert_eq!(added.id, item.id),
        other => panic!("Expected ItemAdded, got {other:?}"),
    }
    assert_silent(&mut alice_events).await;
    assert_eq!(alice.pod(pod.id).await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn test_attach_swap_changes_delivery() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let alpha = alice.create_pod("Alpha").await.unwrap();
    let beta = alice.create_pod("Beta").await.unwrap();
    bob.join_pod(&beta.invite_code).await.unwrap();

    alice.attach(alpha.id).await.unwrap();
    bob.attach(beta.id).await.unwrap();

    // Bob writes to Beta; Alice is on Alpha and must hear nothing
    bob.add_item(beta.id, "tea", "Tea", 5.00).await.unwrap();
    assert_silent(&mut alice_events).await;

    // Switching pods starts Beta delivery, snapshot included
    let snapshot = alice.attach(beta.id).await.unwrap();
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].product_id, "tea");

    bob.add_item(beta.id, "coffee", "Coffee", 7.50).await.unwrap();
    let (event, _) = next_change(&mut alice_events).await;
    match event {
        ChangeEvent::ItemAdded { ref item, .. } => assert_eq!(item.product_id, "coffee"),
        other => panic!("Expected ItemAdded, got {other:?}"),
    }
    assert_eq!(alice.pod(beta.id).await.unwrap().items.len(), 2);
}

#[tokio::test]
async fn test_idempotent_join_publishes_nothing() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Twice").await.unwrap();
    alice.attach(pod.id).await.unwrap();

    let first = bob.join_pod(&pod.invite_code).await.unwrap();
    assert_eq!(first.members.len(), 2);
    let (event, _) = next_change(&mut alice_events).await;
    assert!(matches!(event, ChangeEvent::MemberJoined { .. }));

    // Second join: same pod back, no event for Alice
    let second = bob.join_pod(&pod.invite_code).await.unwrap();
    assert_eq!(second.members.len(), 2);
    assert_silent(&mut alice_events).await;
}

#[tokio::test]
async fn test_sloppy_invite_code_joins() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Sloppy").await.unwrap();
    let sloppy = format!("  {}  ", pod.invite_code.to_lowercase());
    let joined = bob.join_pod(sloppy).await.unwrap();
    assert_eq!(joined.id, pod.id);
}

#[tokio::test]
async fn test_unknown_invite_code_rejected() {
    let port = start_test_server().await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    match bob.join_pod("ZZZZ99").await {
        Err(ClientError::Server(WireError::NotFound(_))) => {}
        other => panic!("Expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_quantity_zero_removes_then_remove_is_ok() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;

    let pod = alice.create_pod("Zero").await.unwrap();
    alice.attach(pod.id).await.unwrap();
    let item = alice.add_item(pod.id, "jam", "Jam", 3.80).await.unwrap();

    let outcome = alice.set_item_quantity(item.id, 0).await.unwrap();
    assert!(outcome.is_none(), "Quantity zero removes the item");

    // Removing what is already gone still succeeds
    alice.remove_item(item.id).await.unwrap();

    let authoritative = alice.fetch_pod(pod.id).await.unwrap();
    assert!(authoritative.items.is_empty());
}

#[tokio::test]
async fn test_delete_pod_and_refetch() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Doomed").await.unwrap();
    bob.join_pod(&pod.invite_code).await.unwrap();
    alice.attach(pod.id).await.unwrap();
    bob.attach(pod.id).await.unwrap();

    // Only the owner may delete
    match bob.delete_pod(pod.id).await {
        Err(ClientError::Server(WireError::Permission(_))) => {}
        other => panic!("Expected Permission error, got {other:?}"),
    }

    alice.delete_pod(pod.id).await.unwrap();
    assert!(alice.pods().await.is_empty());

    // Bob discovers the deletion through the recovery path
    match bob.fetch_pod(pod.id).await {
        Err(ClientError::Server(WireError::NotFound(_))) => {}
        other => panic!("Expected NotFound, got {other:?}"),
    }
    let remaining = bob.refresh_pods().await.unwrap();
    assert!(remaining.is_empty());
    assert!(bob.pods().await.is_empty());
}

#[tokio::test]
async fn test_share_invite_is_advisory() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let pod = alice.create_pod("Shared").await.unwrap();
    bob.join_pod(&pod.invite_code).await.unwrap();
    alice.attach(pod.id).await.unwrap();
    bob.attach(pod.id).await.unwrap();

    let before = alice.pod(pod.id).await.unwrap();
    bob.share_invite(pod.id).await.unwrap();

    let (event, outcome) = next_change(&mut alice_events).await;
    match event {
        ChangeEvent::InviteShared { invite_code, shared_by, .. } => {
            assert_eq!(invite_code, pod.invite_code);
            assert_eq!(shared_by, bob.profile().id);
        }
        other => panic!("Expected InviteShared, got {other:?}"),
    }
    assert_eq!(outcome, MergeOutcome::Advisory);
    assert_eq!(alice.pod(pod.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_list_pods_scoped_to_member() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;
    let (bob, _bob_events) = connected_client("Bob", port).await;

    let one = alice.create_pod("One").await.unwrap();
    let _two = alice.create_pod("Two").await.unwrap();
    bob.join_pod(&one.invite_code).await.unwrap();

    let alice_pods = alice.refresh_pods().await.unwrap();
    assert_eq!(alice_pods.len(), 2);

    let bob_pods = bob.refresh_pods().await.unwrap();
    assert_eq!(bob_pods.len(), 1);
    assert_eq!(bob_pods[0].id, one.id);
}

#[tokio::test]
async fn test_validation_errors_propagate() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connected_client("Alice", port).await;

    match alice.create_pod("   ").await {
        Err(ClientError::Server(WireError::Validation(_))) => {}
        other => panic!("Expected Validation error, got {other:?}"),
    }

    let pod = alice.create_pod("Valid").await.unwrap();
    match alice.add_item(pod.id, "", "Nameless", 1.0).await {
        Err(ClientError::Server(WireError::Validation(_))) => {}
        other => panic!("Expected Validation error, got {other:?}"),
    }
    match alice.add_item(pod.id, "sku", "Item", f64::NAN).await {
        Err(ClientError::Server(WireError::Validation(_))) => {}
        other => panic!("Expected Validation error, got {other:?}"),
    }
}
