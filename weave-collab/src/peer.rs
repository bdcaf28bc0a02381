//! Peer link tasks.
//!
//! One task per remote peer owns the link I/O for a document session:
//!
//! ```text
//!            ┌────────────── PeerTask ──────────────┐
//! Connector ─┤ connect ─► hello ─► drive ─► backoff ├─┐
//!            └────────────────▲─────────────────────┘ │
//!                             └───── reconnect ───────┘
//!
//! drive:  link.rx ──decode──► PeerEvent::Frame ──► session actor
//!         outbound mpsc ◄──── session actor (try_send, never blocks)
//!         heartbeat ────────► Ping
//! ```
//!
//! Frames are decoded here, off the session actor. Malformed frames are
//! logged and dropped; the store never sees them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::AwarenessEntry;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::replica::StateVector;
use crate::transport::{Connector, FrameLink};
use crate::update::Update;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Exponential reconnect delay: `initial`, doubled per failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFrame {
    Hello(PeerInfo),
    StateVector(StateVector),
    /// Answer to our state vector
    Diff(Update),
    Update(Update),
    Awareness(Vec<AwarenessEntry>),
    Left,
}

/// What a peer task reports to its session.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        peer_id: Uuid,
        generation: u64,
        outbound: mpsc::Sender<SyncMessage>,
    },
    Frame {
        peer_id: Uuid,
        /// Sender's document clock
        clock: u64,
        frame: PeerFrame,
    },
    Disconnected {
        peer_id: Uuid,
        generation: u64,
    },
}

/// Shared settings for every link of one session.
#[derive(Clone)]
pub struct LinkContext {
    pub local: PeerInfo,
    pub doc_id: Uuid,
    pub events: mpsc::Sender<PeerEvent>,
    pub heartbeat: Duration,
    pub compression_threshold: usize,
    pub outbound_capacity: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Owner side of a running peer task.
pub struct PeerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Dial `connector` and keep the link up until shut down.
    pub fn dial(ctx: LinkContext, peer_id: Uuid, connector: Arc<dyn Connector>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_outbound(ctx, peer_id, connector, shutdown_rx));
        Self { shutdown, task }
    }

    /// Serve an accepted link once; no reconnect.
    pub fn accept(ctx: LinkContext, peer_id: Uuid, link: FrameLink) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            drive(&ctx, peer_id, link, &mut shutdown_rx).await;
        });
        Self { shutdown, task }
    }

    /// Stop the task; queued outbound frames are flushed first.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Shut down and wait (bounded) for the flush.
    pub async fn join(self, limit: Duration) {
        self.shutdown();
        let _ = tokio::time::timeout(limit, self.task).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveEnd {
    /// Link lost; the dialer retries
    Closed,
    /// Shutdown requested or the session is gone
    Stopped,
}

async fn run_outbound(
    ctx: LinkContext,
    peer_id: Uuid,
    connector: Arc<dyn Connector>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(ctx.reconnect_initial, ctx.reconnect_max);
    let endpoint = connector.endpoint();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = tokio::select! {
            result = connector.connect() => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok(link) => {
                backoff.reset();
                log::info!("Connected to peer {peer_id} at {endpoint}");
                if drive(&ctx, peer_id, link, &mut shutdown).await == DriveEnd::Stopped {
                    break;
                }
                log::info!("Link to peer {peer_id} lost, reconnecting");
            }
            Err(e) => {
                log::warn!("Connecting to peer {peer_id} at {endpoint} failed: {e}");
            }
        }

        let delay = backoff.next_delay();
        log::debug!("Retrying peer {peer_id} in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    log::debug!("Peer task for {peer_id} stopped");
}

async fn drive(
    ctx: &LinkContext,
    peer_id: Uuid,
    link: FrameLink,
    shutdown: &mut watch::Receiver<bool>,
) -> DriveEnd {
    let FrameLink { tx, mut rx } = link;
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let (outbound, mut outbound_rx) = mpsc::channel::<SyncMessage>(ctx.outbound_capacity);

    let hello = match SyncMessage::peer_joined(ctx.local.peer_id, ctx.doc_id, &ctx.local) {
        Ok(hello) => hello,
        Err(e) => {
            log::warn!("Cannot build hello for peer {peer_id}: {e}");
            return DriveEnd::Stopped;
        }
    };
    if write(ctx, &tx, hello).await.is_err() {
        return DriveEnd::Closed;
    }

    let connected = PeerEvent::Connected {
        peer_id,
        generation,
        outbound,
    };
    if ctx.events.send(connected).await.is_err() {
        return DriveEnd::Stopped;
    }

    let mut heartbeat = tokio::time::interval(ctx.heartbeat);
    heartbeat.tick().await;

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Flush what the session queued before asking us to stop
                while let Ok(msg) = outbound_rx.try_recv() {
                    if write(ctx, &tx, msg).await.is_err() {
                        break;
                    }
                }
                break DriveEnd::Stopped;
            }

            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break DriveEnd::Stopped };
                if write(ctx, &tx, msg).await.is_err() {
                    break DriveEnd::Closed;
                }
            }

            frame = rx.recv() => {
                let Some(bytes) = frame else { break DriveEnd::Closed };
                match decode_frame(ctx, &bytes) {
                    Ok(Inbound::Ping) => {
                        let pong = SyncMessage::pong(ctx.local.peer_id, ctx.doc_id);
                        if write(ctx, &tx, pong).await.is_err() {
                            break DriveEnd::Closed;
                        }
                    }
                    Ok(Inbound::Pong) => log::trace!("Pong from {peer_id}"),
                    Ok(Inbound::Frame { clock, frame }) => {
                        let event = PeerEvent::Frame { peer_id, clock, frame };
                        if ctx.events.send(event).await.is_err() {
                            break DriveEnd::Stopped;
                        }
                    }
                    Err(e) => log::warn!("Discarding frame from {peer_id}: {e}"),
                }
            }

            _ = heartbeat.tick() => {
                let ping = SyncMessage::ping(ctx.local.peer_id, ctx.doc_id);
                if write(ctx, &tx, ping).await.is_err() {
                    break DriveEnd::Closed;
                }
            }
        }
    };

    let _ = ctx.events.send(PeerEvent::Disconnected { peer_id, generation }).await;
    end
}

async fn write(ctx: &LinkContext, tx: &mpsc::Sender<Vec<u8>>, msg: SyncMessage) -> Result<(), ProtocolError> {
    let msg_type = msg.msg_type;
    let bytes = match msg.compress_above(ctx.compression_threshold).encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to encode {msg_type:?}: {e}");
            return Ok(());
        }
    };
    tx.send(bytes).await.map_err(|_| ProtocolError::ConnectionClosed)
}

enum Inbound {
    Ping,
    Pong,
    Frame { clock: u64, frame: PeerFrame },
}

fn decode_frame(ctx: &LinkContext, bytes: &[u8]) -> Result<Inbound, ProtocolError> {
    let msg = SyncMessage::decode(bytes)?;
    if msg.doc_id != ctx.doc_id {
        return Err(ProtocolError::WrongDocument(msg.doc_id));
    }
    let frame = match msg.msg_type {
        MessageType::Ping => return Ok(Inbound::Ping),
        MessageType::Pong => return Ok(Inbound::Pong),
        MessageType::PeerJoined => PeerFrame::Hello(msg.peer_info()?),
        MessageType::SyncStep1 => PeerFrame::StateVector(msg.state_vector()?),
        MessageType::SyncStep2 => PeerFrame::Diff(msg.document_update()?),
        MessageType::Update => PeerFrame::Update(msg.document_update()?),
        MessageType::Awareness => PeerFrame::Awareness(msg.awareness_entries()?),
        MessageType::PeerLeft => PeerFrame::Left,
    };
    Ok(Inbound::Frame {
        clock: msg.clock,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn context(doc_id: Uuid) -> (LinkContext, mpsc::Receiver<PeerEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        let ctx = LinkContext {
            local: PeerInfo::new("local"),
            doc_id,
            events,
            heartbeat: Duration::from_secs(30),
            compression_threshold: 1024,
            outbound_capacity: 16,
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
        };
        (ctx, events_rx)
    }

    async fn recv_raw(link: &mut FrameLink) -> SyncMessage {
        let bytes = tokio::time::timeout(Duration::from_secs(2), link.rx.recv())
            .await
            .unwrap()
            .unwrap();
        SyncMessage::decode(&bytes).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 10_000, 10_000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_accepted_link_sends_hello_and_reports() {
        let doc = Uuid::new_v4();
        let (ctx, mut events) = context(doc);
        let remote = Uuid::new_v4();
        let (local_end, mut remote_end) = FrameLink::pair(16);

        let handle = PeerHandle::accept(ctx.clone(), remote, local_end);

        let hello = recv_raw(&mut remote_end).await;
        assert_eq!(hello.msg_type, MessageType::PeerJoined);
        assert_eq!(hello.peer_info().unwrap().peer_id, ctx.local.peer_id);

        let Some(PeerEvent::Connected { peer_id, outbound, .. }) = events.recv().await else {
            panic!("expected Connected");
        };
        assert_eq!(peer_id, remote);

        let sv: StateVector = [(3, 7)].into_iter().collect();
        let frame = SyncMessage::sync_step1(remote, doc, 7, &sv).encode().unwrap();
        remote_end.tx.send(frame).await.unwrap();
        match events.recv().await {
            Some(PeerEvent::Frame { clock, frame, .. }) => {
                assert_eq!(clock, 7);
                assert_eq!(frame, PeerFrame::StateVector(sv));
            }
            other => panic!("expected Frame, got {other:?}"),
        }

        outbound.try_send(SyncMessage::peer_left(ctx.local.peer_id, doc)).unwrap();
        assert_eq!(recv_raw(&mut remote_end).await.msg_type, MessageType::PeerLeft);

        handle.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_ping_is_answered_on_link() {
        let doc = Uuid::new_v4();
        let (ctx, _events) = context(doc);
        let (local_end, mut remote_end) = FrameLink::pair(16);
        let _handle = PeerHandle::accept(ctx, Uuid::new_v4(), local_end);

        recv_raw(&mut remote_end).await;
        let ping = SyncMessage::ping(Uuid::new_v4(), doc).encode().unwrap();
        remote_end.tx.send(ping).await.unwrap();
        assert_eq!(recv_raw(&mut remote_end).await.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let doc = Uuid::new_v4();
        let (ctx, mut events) = context(doc);
        let remote = Uuid::new_v4();
        let (local_end, mut remote_end) = FrameLink::pair(16);
        let _handle = PeerHandle::accept(ctx, remote, local_end);
        assert!(matches!(events.recv().await, Some(PeerEvent::Connected { .. })));

        remote_end.tx.send(vec![0xFF, 0x00]).await.unwrap();
        let mut bad = SyncMessage::update(remote, doc, 0, &Update::default());
        bad.payload = vec![9, 9, 9];
        remote_end.tx.send(bad.encode().unwrap()).await.unwrap();
        let foreign = SyncMessage::peer_left(remote, Uuid::new_v4());
        remote_end.tx.send(foreign.encode().unwrap()).await.unwrap();

        let good = SyncMessage::peer_left(remote, doc);
        remote_end.tx.send(good.encode().unwrap()).await.unwrap();
        match events.recv().await {
            Some(PeerEvent::Frame { frame, .. }) => assert_eq!(frame, PeerFrame::Left),
            other => panic!("expected Left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dialer_reconnects() {
        let doc = Uuid::new_v4();
        let (ctx, mut events) = context(doc);
        let net = MemoryNetwork::new();
        let remote = Uuid::new_v4();

        let handle = PeerHandle::dial(ctx, remote, Arc::new(net.connector("bob")));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut listener = net.listen("bob");
        let first = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let Some(PeerEvent::Connected { generation: g1, .. }) = events.recv().await else {
            panic!("expected Connected");
        };

        drop(first);
        match events.recv().await {
            Some(PeerEvent::Disconnected { generation, .. }) => assert_eq!(generation, g1),
            other => panic!("expected Disconnected, got {other:?}"),
        }

        let _second = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let Some(PeerEvent::Connected { generation: g2, .. }) = events.recv().await else {
            panic!("expected reconnect");
        };
        assert_ne!(g1, g2);

        handle.join(Duration::from_secs(1)).await;
    }
}
