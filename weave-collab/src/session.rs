//! Document session: one replica, its awareness, and its peer links.
//!
//! ## Architecture
//!
//! ```text
//!   DocumentSession (cloneable handle)
//!        │ Command (mpsc, oneshot replies)
//!        ▼
//! ┌───────────────── SessionActor ─────────────────┐
//! │ ReplicaStore   Awareness   CausalBuffer        │ ◄── PeerEvent (decoded)
//! │ peers: peer_id → PeerSlot { ack SV, outbound } │ ──► try_send SyncMessage
//! │ tick: expiry, renewal, resync, anti-entropy    │
//! └────────────────────────────────────────────────┘
//!        │ callbacks (on the actor task)
//!        ▼
//!   RemoteChange / PresenceEvent / SessionStatus listeners
//! ```
//!
//! Every mutation goes through the actor, so the store has a single
//! writer. Peer I/O never blocks it: inbound frames arrive decoded and
//! outbound frames are queued with `try_send` (dropped when full; the
//! periodic state vector exchange repairs the gap).
//!
//! Handshake per link: both sides send `SyncStep1` with their state
//! vector and answer the other's with a `SyncStep2` delta. Incremental
//! changes travel as `Update`; updates received from one peer are relayed
//! to the others, minus what each peer has already acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::awareness::{
    Awareness, AwarenessChange, AwarenessEntry, AwarenessRecord, PresenceState, PresenceUser,
};
use crate::config::SessionConfig;
use crate::pending::CausalBuffer;
use crate::peer::{LinkContext, PeerEvent, PeerFrame, PeerHandle};
use crate::protocol::{PeerInfo, SyncMessage};
use crate::replica::{Anchor, DiffOp, ItemId, ReplicaError, ReplicaStore, StateVector};
use crate::transport::{Connector, FrameLink};
use crate::update::Update;

/// How long `close` waits for each peer task to flush its departure frames.
const CLOSE_FLUSH: Duration = Duration::from_millis(500);

/// Connectivity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No peer has ever connected
    Offline,
    /// At least one live link; `synced` once every link finished its
    /// state vector exchange
    Connected { peers: usize, synced: bool },
    /// Every link was lost; editing continues locally
    Disconnected,
}

/// A remote peer's cursor resolved against the local replica.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub client_id: u64,
    pub user: Option<PresenceUser>,
    pub position: usize,
    /// Selected range as `(anchor, head)` positions
    pub selection: Option<(usize, usize)>,
}

/// Content change caused by a remote peer.
pub struct RemoteChange<'a> {
    /// Peer the change arrived from (may have relayed it)
    pub origin: Uuid,
    /// Ops to apply to the editor, in order
    pub ops: &'a [DiffOp],
    store: &'a ReplicaStore,
    awareness: &'a Awareness,
}

impl RemoteChange<'_> {
    pub fn text(&self) -> String {
        self.store.text()
    }

    /// Remote cursors re-resolved after the change.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        remote_cursors(self.store, self.awareness)
    }
}

/// Awareness change with read access to the current records.
pub struct PresenceEvent<'a> {
    pub change: &'a AwarenessChange,
    store: &'a ReplicaStore,
    awareness: &'a Awareness,
}

impl PresenceEvent<'_> {
    pub fn record(&self, client_id: u64) -> Option<&AwarenessRecord> {
        self.awareness.get(client_id)
    }

    pub fn records(&self) -> Vec<AwarenessRecord> {
        self.awareness.records().cloned().collect()
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        remote_cursors(self.store, self.awareness)
    }
}

pub type RemoteChangeCallback = Box<dyn Fn(&RemoteChange<'_>) + Send + Sync>;
pub type PresenceCallback = Box<dyn Fn(&PresenceEvent<'_>) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(SessionStatus) + Send + Sync>;

type Inspect = Box<dyn FnOnce(&ReplicaStore, &Awareness) + Send>;

enum Command {
    Insert {
        index: usize,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Delete {
        index: usize,
        len: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Seed {
        text: String,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    SetAwareness {
        payload: Option<Vec<u8>>,
        reply: oneshot::Sender<()>,
    },
    Inspect(Inspect),
    OnRemoteChange(RemoteChangeCallback),
    OnPresence(PresenceCallback),
    OnStatus(StatusCallback),
    Status(oneshot::Sender<SessionStatus>),
    ConnectedPeers(oneshot::Sender<Vec<Uuid>>),
    Connect {
        peer_id: Uuid,
        connector: Arc<dyn Connector>,
    },
    Attach {
        info: PeerInfo,
        link: FrameLink,
    },
    DisconnectPeer(Uuid),
    Close(oneshot::Sender<()>),
}

/// Handle to an open document. Cheap to clone; all clones drive the
/// same actor.
#[derive(Clone)]
pub struct DocumentSession {
    doc_id: Uuid,
    local: PeerInfo,
    client_id: u64,
    commands: mpsc::Sender<Command>,
}

impl DocumentSession {
    /// Open a session with a fresh random client id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(doc_id: Uuid, local: PeerInfo, config: SessionConfig) -> Self {
        Self::open_with_client_id(doc_id, local, random_client_id(), config)
    }

    /// Open a session with a fixed client id. Client ids must never be
    /// reused across sessions of the same document.
    pub fn open_with_client_id(
        doc_id: Uuid,
        local: PeerInfo,
        client_id: u64,
        config: SessionConfig,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(config.command_capacity);
        let (events, events_rx) = mpsc::channel(config.command_capacity);

        let actor = SessionActor {
            doc_id,
            local: local.clone(),
            store: ReplicaStore::new(client_id),
            awareness: Awareness::new(client_id, config.awareness_timeout),
            buffer: CausalBuffer::new(config.buffer),
            peers: HashMap::new(),
            events,
            remote_listeners: Vec::new(),
            presence_listeners: Vec::new(),
            status_listeners: Vec::new(),
            status: SessionStatus::Offline,
            ever_connected: false,
            last_sync: Instant::now(),
            config,
        };
        log::info!("Opened doc {doc_id} as client {client_id} ({})", local.name);
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            doc_id,
            local,
            client_id,
            commands,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Insert `text` at live position `index` and broadcast it.
    pub async fn local_insert(&self, index: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::Insert { index, text, reply }).await?
    }

    /// Delete `len` live units starting at `index` and broadcast it.
    pub async fn local_delete(&self, index: usize, len: usize) -> Result<(), SessionError> {
        self.request(|reply| Command::Delete { index, len, reply }).await?
    }

    /// Insert `text` only if the document has no live content.
    /// Returns whether it was inserted.
    pub async fn seed(&self, text: impl Into<String>) -> Result<bool, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Seed { text, reply }).await?
    }

    /// Run `f` against the replica on the actor and return its result.
    pub async fn read<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&ReplicaStore) -> R + Send + 'static,
    {
        self.inspect(move |store, _| f(store)).await
    }

    /// Current live content.
    pub async fn text(&self) -> Result<String, SessionError> {
        self.read(|store| store.snapshot().collect()).await
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionError> {
        self.read(|store| store.state_vector().clone()).await
    }

    /// Anchor for a cursor at live `index`.
    pub async fn anchor_at(&self, index: usize) -> Result<Anchor, SessionError> {
        self.read(move |store| store.anchor_at(index)).await
    }

    pub async fn resolve_anchor(&self, anchor: Anchor) -> Result<Option<usize>, SessionError> {
        self.read(move |store| store.resolve_anchor(&anchor)).await
    }

    /// Cursors of the other clients, resolved to live positions.
    pub async fn remote_cursors(&self) -> Result<Vec<RemoteCursor>, SessionError> {
        self.inspect(remote_cursors).await
    }

    /// Called on the actor task for every remote content change.
    pub async fn on_remote_change<F>(&self, callback: F) -> Result<(), SessionError>
    where
        F: Fn(&RemoteChange<'_>) + Send + Sync + 'static,
    {
        self.send(Command::OnRemoteChange(Box::new(callback))).await
    }

    pub async fn on_status<F>(&self, callback: F) -> Result<(), SessionError>
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        self.send(Command::OnStatus(Box::new(callback))).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(Command::Status).await
    }

    /// Peers with a live link.
    pub async fn connected_peers(&self) -> Result<Vec<Uuid>, SessionError> {
        self.request(Command::ConnectedPeers).await
    }

    pub fn awareness(&self) -> AwarenessHandle {
        AwarenessHandle {
            commands: self.commands.clone(),
        }
    }

    /// Dial a peer through `connector`, reconnecting with backoff until
    /// the peer leaves or is disconnected.
    pub async fn connect(&self, peer_id: Uuid, connector: Arc<dyn Connector>) -> Result<(), SessionError> {
        self.send(Command::Connect { peer_id, connector }).await
    }

    /// Serve an inbound link whose hello identified `info`.
    pub async fn attach(&self, info: PeerInfo, link: FrameLink) -> Result<(), SessionError> {
        self.send(Command::Attach { info, link }).await
    }

    pub async fn disconnect_peer(&self, peer_id: Uuid) -> Result<(), SessionError> {
        self.send(Command::DisconnectPeer(peer_id)).await
    }

    /// Announce departure to every peer, stop all links and end the actor.
    ///
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) {
        if self.request(Command::Close).await.is_err() {
            log::debug!("Doc {} already closed", self.doc_id);
        }
    }

    async fn inspect<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&ReplicaStore, &Awareness) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Inspect(Box::new(move |store: &ReplicaStore, awareness: &Awareness| {
            let _ = tx.send(f(store, awareness));
        })))
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }
}

/// Presence side of a [`DocumentSession`].
#[derive(Clone)]
pub struct AwarenessHandle {
    commands: mpsc::Sender<Command>,
}

impl AwarenessHandle {
    /// Replace the local presence payload (`None` clears it) and
    /// broadcast it to every peer.
    pub async fn set_local_state(&self, payload: Option<Vec<u8>>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetAwareness { payload, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn set_presence(&self, presence: &PresenceState) -> Result<(), SessionError> {
        let payload = presence
            .to_payload()
            .map_err(|e| SessionError::Presence(e.to_string()))?;
        self.set_local_state(Some(payload)).await
    }

    /// Called on the actor task for additions, updates and removals.
    pub async fn on_change<F>(&self, callback: F) -> Result<(), SessionError>
    where
        F: Fn(&PresenceEvent<'_>) + Send + Sync + 'static,
    {
        self.commands
            .send(Command::OnPresence(Box::new(callback)))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// All live presence records, local included.
    pub async fn states(&self) -> Result<Vec<AwarenessRecord>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let inspect: Inspect = Box::new(move |_: &ReplicaStore, awareness: &Awareness| {
            let _ = tx.send(awareness.records().cloned().collect());
        });
        self.commands
            .send(Command::Inspect(inspect))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Errors surfaced to session API callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Replica(ReplicaError),
    /// Presence could not be serialized
    Presence(String),
    /// The session was closed
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replica(e) => write!(f, "{e}"),
            Self::Presence(e) => write!(f, "Presence error: {e}"),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ReplicaError> for SessionError {
    fn from(e: ReplicaError) -> Self {
        SessionError::Replica(e)
    }
}

fn random_client_id() -> u64 {
    let (high, low) = Uuid::new_v4().as_u64_pair();
    high ^ low
}

fn remote_cursors(store: &ReplicaStore, awareness: &Awareness) -> Vec<RemoteCursor> {
    let local = awareness.local_client();
    let mut cursors: Vec<RemoteCursor> = awareness
        .records()
        .filter(|record| record.client_id != local)
        .filter_map(|record| {
            let presence = record.presence()?;
            let position = store.resolve_anchor(&presence.cursor?)?;
            let selection = presence
                .selection
                .and_then(|(anchor, head)| Some((store.resolve_anchor(&anchor)?, store.resolve_anchor(&head)?)));
            Some(RemoteCursor {
                client_id: record.client_id,
                user: presence.user,
                position,
                selection,
            })
        })
        .collect();
    cursors.sort_by_key(|cursor| cursor.client_id);
    cursors
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

/// Live link to one peer.
struct LinkState {
    generation: u64,
    outbound: mpsc::Sender<SyncMessage>,
    connected_at: Instant,
    /// What the peer is known to hold; filters relays
    acked: StateVector,
    /// Tombstones received from or queued to the peer on this link
    deletions: HashSet<ItemId>,
    /// The peer's SyncStep1 arrived
    received_state: bool,
    /// Our SyncStep1 was answered
    synced: bool,
    resync_requested: bool,
}

struct PeerSlot {
    info: Option<PeerInfo>,
    handle: PeerHandle,
    /// Dialed links reconnect; accepted links end with the connection
    dialed: bool,
    link: Option<LinkState>,
}

struct SessionActor {
    doc_id: Uuid,
    local: PeerInfo,
    config: SessionConfig,
    store: ReplicaStore,
    awareness: Awareness,
    buffer: CausalBuffer,
    peers: HashMap<Uuid, PeerSlot>,
    events: mpsc::Sender<PeerEvent>,
    remote_listeners: Vec<RemoteChangeCallback>,
    presence_listeners: Vec<PresenceCallback>,
    status_listeners: Vec<StatusCallback>,
    status: SessionStatus,
    ever_connected: bool,
    last_sync: Instant,
}

/// Queue a frame without blocking; false when it was dropped.
fn deliver(peer_id: &Uuid, link: &LinkState, msg: SyncMessage) -> bool {
    match link.outbound.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            log::warn!("Outbound queue to {peer_id} full, dropping {:?}", msg.msg_type);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<PeerEvent>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let closed_by = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(reply)) => break Some(reply),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
        };

        drop(commands);
        self.shutdown().await;
        if let Some(reply) = closed_by {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Insert { index, text, reply } => {
                let _ = reply.send(self.local_insert(index, &text));
            }
            Command::Delete { index, len, reply } => {
                let _ = reply.send(self.local_delete(index, len));
            }
            Command::Seed { text, reply } => {
                let result = if self.store.is_empty() && !text.is_empty() {
                    self.local_insert(0, &text).map(|_| true)
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
            }
            Command::SetAwareness { payload, reply } => {
                let (entry, change) = self.awareness.set_local_state(payload, Instant::now());
                self.broadcast_awareness(vec![entry], None);
                self.notify_presence(&change);
                let _ = reply.send(());
            }
            Command::Inspect(f) => f(&self.store, &self.awareness),
            Command::OnRemoteChange(callback) => self.remote_listeners.push(callback),
            Command::OnPresence(callback) => self.presence_listeners.push(callback),
            Command::OnStatus(callback) => self.status_listeners.push(callback),
            Command::Status(reply) => {
                let _ = reply.send(self.status);
            }
            Command::ConnectedPeers(reply) => {
                let peers = self
                    .peers
                    .iter()
                    .filter(|(_, slot)| slot.link.is_some())
                    .map(|(peer_id, _)| *peer_id)
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Connect { peer_id, connector } => self.connect(peer_id, connector),
            Command::Attach { info, link } => self.attach(info, link),
            Command::DisconnectPeer(peer_id) => {
                if let Some(slot) = self.peers.remove(&peer_id) {
                    log::info!("Disconnecting peer {peer_id} from doc {}", self.doc_id);
                    slot.handle.shutdown();
                    self.refresh_status();
                }
            }
            // Taken by the run loop before dispatch
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn link_context(&self) -> LinkContext {
        LinkContext {
            local: self.local.clone(),
            doc_id: self.doc_id,
            events: self.events.clone(),
            heartbeat: self.config.heartbeat_interval,
            compression_threshold: self.config.compression_threshold,
            outbound_capacity: self.config.outbound_capacity,
            reconnect_initial: self.config.reconnect_initial,
            reconnect_max: self.config.reconnect_max,
        }
    }

    fn connect(&mut self, peer_id: Uuid, connector: Arc<dyn Connector>) {
        if peer_id == self.local.peer_id {
            log::warn!("Ignoring request to connect doc {} to itself", self.doc_id);
            return;
        }
        if self.peers.contains_key(&peer_id) {
            log::debug!("Peer {peer_id} already has a link");
            return;
        }
        log::debug!("Dialing peer {peer_id} at {}", connector.endpoint());
        let handle = PeerHandle::dial(self.link_context(), peer_id, connector);
        self.peers.insert(
            peer_id,
            PeerSlot {
                info: None,
                handle,
                dialed: true,
                link: None,
            },
        );
    }

    fn attach(&mut self, info: PeerInfo, link: FrameLink) {
        let peer_id = info.peer_id;
        if let Some(previous) = self.peers.remove(&peer_id) {
            log::debug!("Replacing existing link to {peer_id}");
            previous.handle.shutdown();
        }
        log::info!("Peer {} ({peer_id}) joined doc {}", info.name, self.doc_id);
        let handle = PeerHandle::accept(self.link_context(), peer_id, link);
        self.peers.insert(
            peer_id,
            PeerSlot {
                info: Some(info),
                handle,
                dialed: false,
                link: None,
            },
        );
    }

    fn local_insert(&mut self, index: usize, text: &str) -> Result<(), SessionError> {
        let ids = self.store.insert_text(index, text)?;
        if ids.is_empty() {
            return Ok(());
        }
        let items = ids.iter().filter_map(|id| self.store.get(id).cloned()).collect();
        self.broadcast_update(Update::new(items, Vec::new()), None);
        Ok(())
    }

    fn local_delete(&mut self, index: usize, len: usize) -> Result<(), SessionError> {
        let removed = self.store.delete(index, len)?;
        if !removed.is_empty() {
            self.broadcast_update(Update::new(Vec::new(), removed), None);
        }
        Ok(())
    }

    /// Send an update to every connected peer except `except`, skipping
    /// items a peer already acknowledged.
    fn broadcast_update(&mut self, update: Update, except: Option<Uuid>) {
        let clock = self.store.clock();
        for (peer_id, slot) in self.peers.iter_mut() {
            if Some(*peer_id) == except {
                continue;
            }
            let Some(link) = slot.link.as_mut() else { continue };

            let items = update
                .items
                .iter()
                .filter(|item| !link.acked.contains(&item.id))
                .cloned()
                .collect();
            let deletions = update
                .deletions
                .iter()
                .filter(|id| !link.deletions.contains(id))
                .copied()
                .collect();
            let filtered = Update::new(items, deletions);
            if filtered.is_empty() {
                continue;
            }

            let msg = SyncMessage::update(self.local.peer_id, self.doc_id, clock, &filtered);
            if deliver(peer_id, link, msg) {
                link.acked.merge(&filtered.state_vector());
                link.deletions.extend(filtered.deletions);
            }
        }
    }

    fn broadcast_awareness(&self, entries: Vec<AwarenessEntry>, except: Option<Uuid>) {
        if entries.is_empty() {
            return;
        }
        let msg = SyncMessage::awareness(self.local.peer_id, self.doc_id, &entries);
        for (peer_id, slot) in &self.peers {
            if Some(*peer_id) == except {
                continue;
            }
            if let Some(link) = &slot.link {
                deliver(peer_id, link, msg.clone());
            }
        }
    }

    /// Ask a peer for everything it has.
    fn request_full_state(&mut self, peer_id: Uuid) {
        let msg = SyncMessage::sync_step1(
            self.local.peer_id,
            self.doc_id,
            self.store.clock(),
            &StateVector::new(),
        );
        if let Some(link) = self.peers.get_mut(&peer_id).and_then(|slot| slot.link.as_mut()) {
            if deliver(&peer_id, link, msg) {
                link.resync_requested = true;
            }
        }
    }

    // ─── Peer events ───────────────────────────────────────────────

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                peer_id,
                generation,
                outbound,
            } => self.on_connected(peer_id, generation, outbound),
            PeerEvent::Frame { peer_id, clock, frame } => self.on_frame(peer_id, clock, frame),
            PeerEvent::Disconnected { peer_id, generation } => self.on_disconnected(peer_id, generation),
        }
    }

    fn on_connected(&mut self, peer_id: Uuid, generation: u64, outbound: mpsc::Sender<SyncMessage>) {
        let Some(slot) = self.peers.get_mut(&peer_id) else {
            log::debug!("Dropping link to removed peer {peer_id}");
            return;
        };

        let link = LinkState {
            generation,
            outbound,
            connected_at: Instant::now(),
            acked: StateVector::new(),
            deletions: HashSet::new(),
            received_state: false,
            synced: false,
            resync_requested: false,
        };

        let step1 = SyncMessage::sync_step1(
            self.local.peer_id,
            self.doc_id,
            self.store.clock(),
            self.store.state_vector(),
        );
        deliver(&peer_id, &link, step1);

        let entries = self.awareness.entries();
        if !entries.is_empty() {
            deliver(
                &peer_id,
                &link,
                SyncMessage::awareness(self.local.peer_id, self.doc_id, &entries),
            );
        }

        slot.link = Some(link);
        self.ever_connected = true;
        log::info!("Link to peer {peer_id} up for doc {}", self.doc_id);
        self.refresh_status();
    }

    fn on_disconnected(&mut self, peer_id: Uuid, generation: u64) {
        let Some(slot) = self.peers.get_mut(&peer_id) else { return };
        if slot.link.as_ref().map(|link| link.generation) != Some(generation) {
            return;
        }
        slot.link = None;
        if !slot.dialed {
            self.peers.remove(&peer_id);
        }
        log::info!("Peer {peer_id} disconnected from doc {}", self.doc_id);
        self.refresh_status();
    }

    fn on_frame(&mut self, peer_id: Uuid, clock: u64, frame: PeerFrame) {
        let connected = self
            .peers
            .get(&peer_id)
            .is_some_and(|slot| slot.link.is_some());
        if !connected {
            log::debug!("Ignoring frame from unlinked peer {peer_id}");
            return;
        }
        log::trace!("Frame from {peer_id} at clock {clock}");

        let now = Instant::now();
        match frame {
            PeerFrame::Hello(info) => {
                log::debug!("Peer {peer_id} is {}", info.name);
                if let Some(slot) = self.peers.get_mut(&peer_id) {
                    slot.info = Some(info);
                }
            }
            PeerFrame::StateVector(state) => self.on_state_vector(peer_id, state),
            PeerFrame::Diff(update) => self.on_update(peer_id, update, true, now),
            PeerFrame::Update(update) => self.on_update(peer_id, update, false, now),
            PeerFrame::Awareness(entries) => {
                let (change, accepted) = self.awareness.apply_remote(entries, now);
                self.broadcast_awareness(accepted, Some(peer_id));
                self.notify_presence(&change);
            }
            PeerFrame::Left => {
                let name = self
                    .peers
                    .get(&peer_id)
                    .and_then(|slot| slot.info.as_ref())
                    .map_or_else(|| "unknown".to_string(), |info| info.name.clone());
                log::info!("Peer {name} ({peer_id}) left doc {}", self.doc_id);
                if let Some(slot) = self.peers.remove(&peer_id) {
                    slot.handle.shutdown();
                }
                self.refresh_status();
            }
        }
    }

    fn on_state_vector(&mut self, peer_id: Uuid, remote: StateVector) {
        let local_client = self.store.client_id();
        let claimed = remote.get(local_client);
        if claimed > self.store.clock() {
            log::warn!(
                "DesyncDetected: peer {peer_id} holds clock {claimed} of client {local_client}, local clock is {}; re-fetching",
                self.store.clock()
            );
            self.request_full_state(peer_id);
        }

        let mut diff = Update::diff(&self.store, &remote);
        let clock = self.store.clock();
        let state = self.store.state_vector().clone();

        let Some(link) = self.peers.get_mut(&peer_id).and_then(|slot| slot.link.as_mut()) else {
            return;
        };
        // Only the first exchange on a link carries the whole tombstone set
        diff.deletions.retain(|id| !link.deletions.contains(id));
        let msg = SyncMessage::sync_step2(self.local.peer_id, self.doc_id, clock, &diff);

        link.received_state = true;
        if deliver(&peer_id, link, msg) {
            link.acked = remote;
            link.acked.merge(&state);
            link.deletions.extend(diff.deletions);
        } else {
            link.acked.merge(&remote);
        }
    }

    fn on_update(&mut self, peer_id: Uuid, update: Update, is_diff: bool, now: Instant) {
        let carried = update.state_vector();
        let carried_deletions = update.deletions.clone();
        let merged = self.buffer.merge(&mut self.store, update, Some(peer_id), now);

        if let Some(link) = self.peers.get_mut(&peer_id).and_then(|slot| slot.link.as_mut()) {
            link.acked.merge(&carried);
            link.deletions.extend(carried_deletions);
            if is_diff {
                link.synced = true;
                link.resync_requested = false;
            }
        }

        if !merged.is_empty() {
            log::debug!(
                "Merged {} items and {} deletions from {peer_id} ({} buffered)",
                merged.items.len(),
                merged.deletions.len(),
                self.buffer.len()
            );
            self.broadcast_update(merged.to_update(), Some(peer_id));
            if !merged.ops.is_empty() {
                self.notify_remote(peer_id, &merged.ops);
            }
        }

        if is_diff {
            self.refresh_status();
        }
    }

    // ─── Timers ────────────────────────────────────────────────────

    fn on_tick(&mut self, now: Instant) {
        let expired = self.awareness.expire(now);
        if !expired.is_empty() {
            log::debug!("Awareness expired for clients {:?}", expired.removed);
            self.notify_presence(&expired);
        }

        if let Some(entry) = self.awareness.renew_local(now, self.config.awareness_renewal()) {
            self.broadcast_awareness(vec![entry], None);
        }

        let resync_timeout = self.config.resync_timeout;
        let silent: Vec<Uuid> = self
            .peers
            .iter()
            .filter_map(|(peer_id, slot)| {
                let link = slot.link.as_ref()?;
                let overdue = !link.received_state
                    && !link.resync_requested
                    && now.duration_since(link.connected_at) >= resync_timeout;
                overdue.then_some(*peer_id)
            })
            .collect();
        for peer_id in silent {
            log::warn!("Peer {peer_id} sent no state vector within {resync_timeout:?}; requesting full resync");
            self.request_full_state(peer_id);
        }

        for peer_id in self.buffer.expire(now) {
            log::warn!("Causal gap from {peer_id} not closed in time; requesting full resync");
            self.request_full_state(peer_id);
        }

        if now.duration_since(self.last_sync) >= self.config.sync_interval {
            self.last_sync = now;
            self.exchange_state_vectors();
        }
    }

    fn exchange_state_vectors(&self) {
        let msg = SyncMessage::sync_step1(
            self.local.peer_id,
            self.doc_id,
            self.store.clock(),
            self.store.state_vector(),
        );
        for (peer_id, slot) in &self.peers {
            if let Some(link) = &slot.link {
                deliver(peer_id, link, msg.clone());
            }
        }
    }

    // ─── Notifications ─────────────────────────────────────────────

    fn notify_remote(&self, origin: Uuid, ops: &[DiffOp]) {
        let change = RemoteChange {
            origin,
            ops,
            store: &self.store,
            awareness: &self.awareness,
        };
        for callback in &self.remote_listeners {
            callback(&change);
        }
    }

    fn notify_presence(&self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        let event = PresenceEvent {
            change,
            store: &self.store,
            awareness: &self.awareness,
        };
        for callback in &self.presence_listeners {
            callback(&event);
        }
    }

    fn refresh_status(&mut self) {
        let links: Vec<&LinkState> = self.peers.values().filter_map(|slot| slot.link.as_ref()).collect();
        let status = if !links.is_empty() {
            SessionStatus::Connected {
                peers: links.len(),
                synced: links.iter().all(|link| link.synced),
            }
        } else if self.ever_connected {
            SessionStatus::Disconnected
        } else {
            SessionStatus::Offline
        };
        self.set_status(status);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status == self.status {
            return;
        }
        log::info!("Doc {} status: {status:?}", self.doc_id);
        self.status = status;
        for callback in &self.status_listeners {
            callback(status);
        }
    }

    async fn shutdown(&mut self) {
        let (change, departure) = self.awareness.clear(Instant::now());
        for (peer_id, slot) in &self.peers {
            let Some(link) = &slot.link else { continue };
            if let Some(entry) = &departure {
                let entries = std::slice::from_ref(entry);
                deliver(peer_id, link, SyncMessage::awareness(self.local.peer_id, self.doc_id, entries));
            }
            deliver(peer_id, link, SyncMessage::peer_left(self.local.peer_id, self.doc_id));
        }
        self.notify_presence(&change);

        let handles: Vec<PeerHandle> = self.peers.drain().map(|(_, slot)| slot.handle).collect();
        futures_util::future::join_all(handles.into_iter().map(|handle| handle.join(CLOSE_FLUSH))).await;

        self.buffer.clear();
        self.set_status(SessionStatus::Offline);
        log::info!("Closed doc {}", self.doc_id);
    }
}
