//! Integration tests for end-to-end document sync.
//!
//! These tests run real sessions over in-memory links and over real
//! WebSocket connections, including discovery through a signaling server.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use uuid::Uuid;
use weave_collab::{
    CollabNode, DocumentSession, MemoryNetwork, NodeConfig, SessionConfig, SessionStatus,
    SignalingServer,
};

fn fast_config() -> SessionConfig {
    SessionConfig {
        tick_interval: Duration::from_millis(20),
        reconnect_initial: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

fn node(name: &str, advertise_url: Option<String>) -> CollabNode {
    CollabNode::new(NodeConfig {
        name: name.to_string(),
        advertise_url,
        session: fast_config(),
    })
}

/// Serve `node` on the in-memory address `addr`.
fn serve_memory(net: &MemoryNetwork, addr: &str, node: &CollabNode) {
    let listener = net.listen(addr);
    let node = node.clone();
    tokio::spawn(async move { node.serve_memory(listener).await });
}

/// Start a signaling server on a free port, return its URL.
async fn start_signaling_server() -> (Arc<SignalingServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SignalingServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

/// Start a node accepting WebSocket peer links on a free port.
async fn start_ws_node(name: &str) -> CollabNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let node = node(name, Some(url));
    let serving = node.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    node
}

async fn wait_for_text(session: &DocumentSession, expected: &str) {
    let converged = timeout(Duration::from_secs(5), async {
        loop {
            if session.text().await.unwrap() == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        converged.is_ok(),
        "expected {expected:?}, have {:?}",
        session.text().await.unwrap()
    );
}

async fn wait_until_equal(a: &DocumentSession, b: &DocumentSession) -> String {
    let converged = timeout(Duration::from_secs(5), async {
        loop {
            let (left, right) = (a.text().await.unwrap(), b.text().await.unwrap());
            if left == right {
                break left;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    converged.expect("replicas never converged")
}

#[tokio::test]
async fn test_two_nodes_converge_over_memory() {
    let net = MemoryNetwork::new();
    let alice = node("alice", None);
    let bob = node("bob", None);
    let doc = Uuid::new_v4();

    let alice_doc = alice.open_document(doc).await;
    alice_doc.local_insert(0, "Hello").await.unwrap();
    serve_memory(&net, "alice", &alice);

    let bob_doc = bob.open_document(doc).await;
    bob_doc
        .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
        .await
        .unwrap();
    wait_for_text(&bob_doc, "Hello").await;

    bob_doc.local_insert(5, ", world").await.unwrap();
    wait_for_text(&alice_doc, "Hello, world").await;

    alice_doc.local_delete(0, 7).await.unwrap();
    wait_for_text(&bob_doc, "world").await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let net = MemoryNetwork::new();
    let alice = node("alice", None);
    let bob = node("bob", None);
    let doc = Uuid::new_v4();

    let alice_doc = alice.open_document(doc).await;
    let bob_doc = bob.open_document(doc).await;

    // Both edit before any link exists
    alice_doc.local_insert(0, "left").await.unwrap();
    bob_doc.local_insert(0, "right").await.unwrap();

    serve_memory(&net, "alice", &alice);
    bob_doc
        .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
        .await
        .unwrap();

    let text = wait_until_equal(&alice_doc, &bob_doc).await;
    assert_eq!(text.len(), "leftright".len());
    assert!(text == "leftright" || text == "rightleft");

    // Concurrent inserts at the same position while linked
    let (a, b) = tokio::join!(alice_doc.local_insert(0, "A"), bob_doc.local_insert(0, "B"));
    a.unwrap();
    b.unwrap();
    let text = wait_until_equal(&alice_doc, &bob_doc).await;
    assert_eq!(text.len(), 11);
}

#[tokio::test]
async fn test_edits_relay_through_middle_peer() {
    let net = MemoryNetwork::new();
    let alice = node("alice", None);
    let bob = node("bob", None);
    let carol = node("carol", None);
    let doc = Uuid::new_v4();

    let alice_doc = alice.open_document(doc).await;
    let bob_doc = bob.open_document(doc).await;
    let carol_doc = carol.open_document(doc).await;

    // alice <-> bob <-> carol, no direct alice <-> carol link
    serve_memory(&net, "alice", &alice);
    serve_memory(&net, "bob", &bob);
    bob_doc
        .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
        .await
        .unwrap();
    carol_doc
        .connect(bob.peer_info().peer_id, Arc::new(net.connector("bob")))
        .await
        .unwrap();

    alice_doc.local_insert(0, "abc").await.unwrap();
    wait_for_text(&carol_doc, "abc").await;

    carol_doc.local_insert(3, "def").await.unwrap();
    wait_for_text(&alice_doc, "abcdef").await;
    wait_for_text(&bob_doc, "abcdef").await;
}

#[tokio::test]
async fn test_dialer_reconnects_when_listener_appears() {
    let net = MemoryNetwork::new();
    let alice = node("alice", None);
    let bob = node("bob", None);
    let doc = Uuid::new_v4();

    let alice_doc = alice.open_document(doc).await;
    alice_doc.local_insert(0, "late").await.unwrap();

    let bob_doc = bob.open_document(doc).await;
    bob_doc.local_insert(0, "early ").await.unwrap();
    bob_doc
        .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
        .await
        .unwrap();

    // Nobody is listening yet; the dialer keeps retrying
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice_doc.text().await.unwrap(), "late");

    serve_memory(&net, "alice", &alice);
    let text = wait_until_equal(&alice_doc, &bob_doc).await;
    assert!(text.contains("late") && text.contains("early "));
}

#[tokio::test]
async fn test_status_reports_synced_peer() {
    let net = MemoryNetwork::new();
    let alice = node("alice", None);
    let bob = node("bob", None);
    let doc = Uuid::new_v4();

    let alice_doc = alice.open_document(doc).await;
    assert_eq!(alice_doc.status().await.unwrap(), SessionStatus::Offline);
    serve_memory(&net, "alice", &alice);

    let bob_doc = bob.open_document(doc).await;
    bob_doc
        .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
        .await
        .unwrap();

    let synced = timeout(Duration::from_secs(5), async {
        loop {
            if let SessionStatus::Connected { peers: 1, synced: true } = bob_doc.status().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok());
    assert_eq!(bob_doc.connected_peers().await.unwrap(), vec![alice.peer_info().peer_id]);

    alice.close_document(doc).await;
    let dropped = timeout(Duration::from_secs(5), async {
        while !bob_doc.connected_peers().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "peer should be gone after it closed the doc");
}

#[tokio::test]
async fn test_websocket_nodes_discover_each_other() {
    let (server, signaling_url) = start_signaling_server().await;
    let alice = start_ws_node("alice").await;
    let bob = start_ws_node("bob").await;
    let doc = Uuid::new_v4();

    let alice_doc = alice.join(doc, &signaling_url).await.unwrap();
    alice_doc.seed("shared notes").await.unwrap();

    // Wait until the server has alice in the room so bob's join reaches her
    let registered = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(room) = server.room_manager().get(&doc).await {
                if room.has_peer(&alice.peer_info().peer_id).await {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(registered.is_ok());

    let bob_doc = bob.join(doc, &signaling_url).await.unwrap();
    wait_for_text(&bob_doc, "shared notes").await;

    bob_doc.local_insert(0, "my ").await.unwrap();
    wait_for_text(&alice_doc, "my shared notes").await;

    // Seeding a non-empty document is a no-op
    assert!(!bob_doc.seed("ignored").await.unwrap());

    bob.close().await;
    alice.close().await;
    assert!(alice_doc.is_closed() && bob_doc.is_closed());
}
