//! Peer discovery over WebSocket rooms.
//!
//! ```text
//! Node A ──┐                         ┌── Node A
//!          ├── Room (doc_id) ── BroadcastGroup
//! Node B ──┘                         └── Node B
//! ```
//!
//! The server never sees document content. A node sends `Join` for a
//! document; members already in the room answer the broadcast `Join`
//! with a `PeerOffer` carrying the URL they accept peer links on, and the
//! newcomer dials it. `PeerOffer`/`PeerAnswer` are delivered only to their
//! addressee; `Join`/`Leave` go to everyone else in the room.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::protocol::ProtocolError;
use crate::transport::{Connector, FrameLink, WsConnector};

/// Discovery messages exchanged through the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMessage {
    Join { doc_id: Uuid, peer_id: Uuid },
    PeerOffer { from: Uuid, to: Uuid, descriptor: String },
    PeerAnswer { from: Uuid, to: Uuid, descriptor: String },
    Leave { peer_id: Uuid },
}

impl SignalMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn sender(&self) -> Uuid {
        match self {
            Self::Join { peer_id, .. } | Self::Leave { peer_id } => *peer_id,
            Self::PeerOffer { from, .. } | Self::PeerAnswer { from, .. } => *from,
        }
    }

    /// The single recipient of an offer or answer.
    pub fn addressee(&self) -> Option<Uuid> {
        match self {
            Self::PeerOffer { to, .. } | Self::PeerAnswer { to, .. } => Some(*to),
            _ => None,
        }
    }

    /// Whether a member `peer_id` should receive this broadcast.
    pub fn is_for(&self, peer_id: Uuid) -> bool {
        self.sender() != peer_id && self.addressee().map_or(true, |to| to == peer_id)
    }
}

/// Signaling server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct SignalingStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    pub active_rooms: usize,
}

type ConnectionError = Box<dyn std::error::Error + Send + Sync>;

/// The signaling server.
pub struct SignalingServer {
    config: SignalingConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<SignalingStats>>,
}

impl SignalingServer {
    pub fn new(config: SignalingConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(SignalingStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SignalingConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signaling server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let stats = self.stats.clone();
            let config = self.config.clone();
            let room_manager = self.room_manager.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, stats, config, room_manager).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        stats: Arc<RwLock<SignalingStats>>,
        config: SignalingConfig,
        room_manager: Arc<RoomManager>,
    ) -> Result<(), ConnectionError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set by the first Join
        let mut member: Option<(Uuid, Uuid)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let signal = match SignalMessage::decode(&bytes) {
                            Ok(signal) => signal,
                            Err(e) => {
                                log::warn!("Failed to decode signal from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        match (&signal, member) {
                            (SignalMessage::Join { doc_id, peer_id }, None) => {
                                let room = room_manager.get_or_create(*doc_id).await;
                                let Some(rx) = room.try_add_peer(*peer_id, config.max_peers_per_room).await else {
                                    log::warn!("Room {doc_id} is full, rejecting {peer_id}");
                                    stats.write().await.rejected_joins += 1;
                                    room_manager.remove_if_empty(doc_id).await;
                                    break;
                                };
                                broadcast_rx = Some(rx);
                                member = Some((*doc_id, *peer_id));
                                room.broadcast_raw(Arc::new(bytes));
                                stats.write().await.active_rooms = room_manager.room_count().await;
                                log::info!("Peer {peer_id} joined room {doc_id}");
                            }
                            (SignalMessage::Join { .. }, Some((doc_id, _))) => {
                                log::debug!("Ignoring second Join from {addr} (already in {doc_id})");
                            }
                            (SignalMessage::Leave { .. }, Some(_)) => break,
                            (SignalMessage::PeerOffer { .. } | SignalMessage::PeerAnswer { .. }, Some((doc_id, peer_id))) => {
                                if signal.sender() != peer_id {
                                    log::warn!("Dropping signal with forged sender from {addr}");
                                    continue;
                                }
                                if let Some(room) = room_manager.get(&doc_id).await {
                                    room.broadcast_raw(Arc::new(bytes));
                                }
                            }
                            (_, None) => {
                                log::debug!("Signal from {addr} before Join: {signal:?}");
                            }
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some((doc_id, peer_id)) = member else { continue };
                        match msg {
                            Ok(data) => {
                                match SignalMessage::decode(&data) {
                                    Ok(signal) if signal.is_for(peer_id) => {
                                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                    }
                                    _ => {}
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id} lagged by {n} signals");
                                if let Some(room) = room_manager.get(&doc_id).await {
                                    room.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), ConnectionError>(())
        }
        .await;

        // Cleanup: leave the room and tell the others
        if let Some((doc_id, peer_id)) = member {
            if let Some(room) = room_manager.get(&doc_id).await {
                room.remove_peer(&peer_id).await;
                let _ = room.broadcast(&SignalMessage::Leave { peer_id });
            }
            if room_manager.remove_if_empty(&doc_id).await {
                log::info!("Room {doc_id} removed (empty)");
            }
            log::info!("Peer {peer_id} left room {doc_id}");
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = room_manager.room_count().await;
        }

        result
    }

    pub async fn stats(&self) -> SignalingStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the signaling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Connected,
    /// Another node joined the room
    PeerJoined(Uuid),
    Offer { from: Uuid, descriptor: String },
    Answer { from: Uuid, descriptor: String },
    PeerLeft(Uuid),
    /// The signaling connection closed
    Disconnected,
}

impl SignalEvent {
    fn from_signal(signal: SignalMessage) -> Self {
        match signal {
            SignalMessage::Join { peer_id, .. } => Self::PeerJoined(peer_id),
            SignalMessage::PeerOffer { from, descriptor, .. } => Self::Offer { from, descriptor },
            SignalMessage::PeerAnswer { from, descriptor, .. } => Self::Answer { from, descriptor },
            SignalMessage::Leave { peer_id } => Self::PeerLeft(peer_id),
        }
    }
}

/// One node's membership in one document room.
pub struct SignalingClient {
    peer_id: Uuid,
    doc_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SignalEvent>>,
    event_tx: mpsc::Sender<SignalEvent>,
}

impl SignalingClient {
    pub fn new(peer_id: Uuid, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id,
            doc_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SignalEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document room.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let link = match WsConnector::new(self.server_url.clone()).connect().await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Signaling connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let FrameLink { tx, mut rx } = link;

        let join = SignalMessage::Join {
            doc_id: self.doc_id,
            peer_id: self.peer_id,
        };
        tx.send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SignalEvent::Connected).await;
        log::info!("Joined signaling room {} at {}", self.doc_id, self.server_url);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_id;
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                match SignalMessage::decode(&bytes) {
                    Ok(signal) if signal.is_for(peer_id) => {
                        if event_tx.send(SignalEvent::from_signal(signal)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Bad signal from server: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SignalEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn send(&self, signal: SignalMessage) -> Result<(), ProtocolError> {
        let encoded = signal.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Offer `descriptor` (a peer link URL, possibly empty) to `to`.
    pub async fn offer(&self, to: Uuid, descriptor: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(SignalMessage::PeerOffer {
            from: self.peer_id,
            to,
            descriptor: descriptor.into(),
        })
        .await
    }

    pub async fn answer(&self, to: Uuid, descriptor: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(SignalMessage::PeerAnswer {
            from: self.peer_id,
            to,
            descriptor: descriptor.into(),
        })
        .await
    }

    /// Announce departure and close the connection.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        let result = self.send(SignalMessage::Leave { peer_id: self.peer_id }).await;
        self.outgoing_tx = None;
        result
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
