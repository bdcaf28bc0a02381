//! One process's collaboration endpoint.
//!
//! A [`CollabNode`] owns the local identity and the open documents. It
//! accepts peer links (WebSocket or in-memory) and routes each one to the
//! session named in the link's hello frame. With [`CollabNode::join`] it
//! also finds peers for a document through a signaling server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::session::DocumentSession;
use crate::signaling::{SignalEvent, SignalingClient};
use crate::transport::{FrameLink, MemoryListener, WsConnector};

/// How long an inbound link may take to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name shown to other peers
    pub name: String,
    /// URL other nodes dial to reach this node's peer listener
    pub advertise_url: Option<String>,
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "Anonymous".to_string(),
            advertise_url: None,
            session: SessionConfig::default(),
        }
    }
}

type Documents = Arc<RwLock<HashMap<Uuid, DocumentSession>>>;

struct Discovery {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Local identity plus the registry of open documents.
#[derive(Clone)]
pub struct CollabNode {
    local: PeerInfo,
    config: NodeConfig,
    documents: Documents,
    discovery: Arc<RwLock<HashMap<Uuid, Discovery>>>,
}

impl CollabNode {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            local: PeerInfo::new(config.name.clone()),
            config,
            documents: Arc::new(RwLock::new(HashMap::new())),
            discovery: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Open a document, or return its session if it is already open.
    pub async fn open_document(&self, doc_id: Uuid) -> DocumentSession {
        let mut documents = self.documents.write().await;
        if let Some(session) = documents.get(&doc_id) {
            if !session.is_closed() {
                return session.clone();
            }
        }
        let session = DocumentSession::open(doc_id, self.local.clone(), self.config.session.clone());
        documents.insert(doc_id, session.clone());
        log::debug!("Registered doc {doc_id} for {} ({})", self.local.name, self.local.peer_id);
        session
    }

    pub async fn document(&self, doc_id: Uuid) -> Option<DocumentSession> {
        self.documents
            .read()
            .await
            .get(&doc_id)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    pub async fn open_documents(&self) -> Vec<Uuid> {
        self.documents
            .read()
            .await
            .iter()
            .filter(|(_, session)| !session.is_closed())
            .map(|(doc_id, _)| *doc_id)
            .collect()
    }

    /// Leave discovery for the document, then close its session.
    pub async fn close_document(&self, doc_id: Uuid) -> bool {
        self.leave(doc_id).await;
        let session = self.documents.write().await.remove(&doc_id);
        match session {
            Some(session) => {
                session.close().await;
                log::info!("Closed doc {doc_id}");
                true
            }
            None => false,
        }
    }

    /// Close every open document.
    pub async fn close(&self) {
        let doc_ids: Vec<Uuid> = self.documents.read().await.keys().copied().collect();
        for doc_id in doc_ids {
            self.close_document(doc_id).await;
        }
    }

    /// Accept WebSocket peer links until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New peer connection from {addr}");
            let documents = self.documents.clone();
            let local_id = self.local.peer_id;
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => route(documents, local_id, FrameLink::from_websocket(ws_stream)).await,
                    Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    /// Accept in-memory peer links until the listener is dropped.
    pub async fn serve_memory(&self, mut listener: MemoryListener) {
        while let Some(link) = listener.accept().await {
            tokio::spawn(route(self.documents.clone(), self.local.peer_id, link));
        }
        log::debug!("Memory listener {} closed", listener.addr());
    }

    /// Open `doc_id` and find its other editors through the signaling
    /// server at `signaling_url`.
    pub async fn join(&self, doc_id: Uuid, signaling_url: &str) -> Result<DocumentSession, ProtocolError> {
        let session = self.open_document(doc_id).await;
        self.leave(doc_id).await;

        let mut client = SignalingClient::new(self.local.peer_id, doc_id, signaling_url);
        let events = client.take_event_rx().ok_or(ProtocolError::ConnectionClosed)?;
        client.connect().await?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(discover(
            client,
            events,
            shutdown_rx,
            session.clone(),
            self.config.advertise_url.clone().unwrap_or_default(),
        ));
        self.discovery.write().await.insert(doc_id, Discovery { shutdown, task });
        Ok(session)
    }

    /// Stop discovery for a document. Existing peer links stay up.
    pub async fn leave(&self, doc_id: Uuid) {
        let discovery = self.discovery.write().await.remove(&doc_id);
        if let Some(Discovery { shutdown, task }) = discovery {
            let _ = shutdown.send(());
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                log::warn!("Discovery for doc {doc_id} did not stop in time");
            }
        }
    }
}

/// Hand an inbound link to the session its hello names.
async fn route(documents: Documents, local_id: Uuid, mut link: FrameLink) {
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, link.rx.recv()).await {
        Ok(Some(bytes)) => SyncMessage::decode(&bytes),
        Ok(None) => return,
        Err(_) => Err(ProtocolError::Timeout),
    };
    let (doc_id, info) = match hello.and_then(|msg| Ok((msg.doc_id, msg.peer_info()?))) {
        Ok(hello) => hello,
        Err(e) => {
            log::warn!("Dropping inbound link without a valid hello: {e}");
            return;
        }
    };
    if info.peer_id == local_id {
        log::warn!("Dropping inbound link from ourselves");
        return;
    }

    let session = documents.read().await.get(&doc_id).cloned();
    match session {
        Some(session) => {
            log::debug!("Routing {} ({}) to doc {doc_id}", info.name, info.peer_id);
            if session.attach(info, link).await.is_err() {
                log::warn!("Doc {doc_id} closed while attaching a peer");
            }
        }
        None => log::warn!("Dropping link from {} for unknown doc {doc_id}", info.peer_id),
    }
}

/// Turn signaling events into peer links.
///
/// Members answer a newcomer's join with an offer carrying their own
/// peer URL; whoever receives a non-empty descriptor dials it. A member
/// without a URL offers an empty descriptor and the newcomer answers
/// with its own instead.
async fn discover(
    mut client: SignalingClient,
    mut events: mpsc::Receiver<SignalEvent>,
    mut shutdown: oneshot::Receiver<()>,
    session: DocumentSession,
    advertise_url: String,
) {
    let doc_id = session.doc_id();
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = client.leave().await {
                    log::debug!("Leave for doc {doc_id} not delivered: {e}");
                }
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let result = match event {
            SignalEvent::Connected => Ok(()),
            SignalEvent::PeerJoined(peer_id) => {
                log::debug!("Peer {peer_id} joined doc {doc_id}, offering");
                client.offer(peer_id, advertise_url.clone()).await
            }
            SignalEvent::Offer { from, descriptor } => {
                if descriptor.is_empty() {
                    client.answer(from, advertise_url.clone()).await
                } else {
                    dial(&session, from, descriptor).await;
                    client.answer(from, String::new()).await
                }
            }
            SignalEvent::Answer { from, descriptor } => {
                if descriptor.is_empty() {
                    log::debug!("Peer {from} answered without a descriptor");
                } else {
                    dial(&session, from, descriptor).await;
                }
                Ok(())
            }
            SignalEvent::PeerLeft(peer_id) => {
                if session.disconnect_peer(peer_id).await.is_err() {
                    break;
                }
                Ok(())
            }
            SignalEvent::Disconnected => {
                log::warn!("Signaling connection for doc {doc_id} lost");
                break;
            }
        };
        if let Err(e) = result {
            log::warn!("Signaling for doc {doc_id} failed: {e}");
            break;
        }
    }
    log::debug!("Discovery for doc {doc_id} stopped");
}

async fn dial(session: &DocumentSession, peer_id: Uuid, url: String) {
    log::info!("Dialing peer {peer_id} at {url} for doc {}", session.doc_id());
    if session.connect(peer_id, Arc::new(WsConnector::new(url))).await.is_err() {
        log::debug!("Doc {} closed before dialing {peer_id}", session.doc_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MemoryNetwork};

    fn node(name: &str) -> CollabNode {
        let config = NodeConfig {
            name: name.to_string(),
            ..NodeConfig::default()
        };
        CollabNode::new(config)
    }

    async fn wait_for_text(session: &DocumentSession, expected: &str) {
        let done = tokio::time::timeout(Duration::from_secs(3), async {
            while session.text().await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(done.is_ok(), "never converged to {expected:?}");
    }

    #[test]
    fn test_node_config_default() {
        let config = NodeConfig::default();
        assert_eq!(config.name, "Anonymous");
        assert!(config.advertise_url.is_none());
        assert_eq!(config.session, SessionConfig::default());
    }

    #[tokio::test]
    async fn test_open_document_is_idempotent() {
        let node = node("alice");
        let doc_id = Uuid::new_v4();

        let first = node.open_document(doc_id).await;
        first.local_insert(0, "hi").await.unwrap();
        let second = node.open_document(doc_id).await;
        assert_eq!(second.text().await.unwrap(), "hi");
        assert_eq!(node.open_documents().await, vec![doc_id]);
        assert_eq!(first.local_peer(), node.peer_info());
    }

    #[tokio::test]
    async fn test_close_document() {
        let node = node("alice");
        let doc_id = Uuid::new_v4();
        let session = node.open_document(doc_id).await;

        assert!(node.close_document(doc_id).await);
        assert!(session.is_closed());
        assert!(node.document(doc_id).await.is_none());
        assert!(!node.close_document(doc_id).await);

        // Reopening starts a fresh session
        let reopened = node.open_document(doc_id).await;
        assert!(!reopened.is_closed());
        node.close().await;
        assert!(node.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_links_route_by_document() {
        let net = MemoryNetwork::new();
        let alice = node("alice");
        let bob = node("bob");
        let doc_id = Uuid::new_v4();

        let alice_doc = alice.open_document(doc_id).await;
        alice_doc.local_insert(0, "shared").await.unwrap();
        let serving = alice.clone();
        let listener = net.listen("alice");
        tokio::spawn(async move { serving.serve_memory(listener).await });

        let bob_doc = bob.open_document(doc_id).await;
        bob_doc
            .connect(alice.peer_info().peer_id, Arc::new(net.connector("alice")))
            .await
            .unwrap();
        wait_for_text(&bob_doc, "shared").await;

        bob_doc.local_insert(6, "!").await.unwrap();
        wait_for_text(&alice_doc, "shared!").await;
    }

    #[tokio::test]
    async fn test_unknown_document_link_is_dropped() {
        let net = MemoryNetwork::new();
        let alice = node("alice");
        let serving = alice.clone();
        let listener = net.listen("alice");
        tokio::spawn(async move { serving.serve_memory(listener).await });

        let mut link = net.connector("alice").connect().await.unwrap();
        let stranger = PeerInfo::new("mallory");
        let hello = SyncMessage::peer_joined(stranger.peer_id, Uuid::new_v4(), &stranger).unwrap();
        link.tx.send(hello.encode().unwrap()).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(3), link.rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_link_without_hello_is_dropped() {
        let net = MemoryNetwork::new();
        let alice = node("alice");
        alice.open_document(Uuid::new_v4()).await;
        let serving = alice.clone();
        let listener = net.listen("alice");
        tokio::spawn(async move { serving.serve_memory(listener).await });

        let mut link = net.connector("alice").connect().await.unwrap();
        link.tx.send(vec![0xde, 0xad]).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(3), link.rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}
