//! Fan-out for signaling rooms.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to
//! `capacity` messages; a member that falls further behind lags and
//! loses the oldest messages.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::signaling::SignalMessage;

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// All members of one document's signaling room.
///
/// Every message goes to every member; receivers drop their own
/// messages and offers/answers addressed to someone else.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a member; returns its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    /// Add a member unless the room already holds `max_peers`.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// joins cannot overfill the room.
    pub async fn try_add_peer(&self, peer_id: Uuid, max_peers: usize) -> Option<broadcast::Receiver<Arc<Vec<u8>>>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max_peers && !peers.contains(&peer_id) {
            return None;
        }
        peers.insert(peer_id);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, msg: &SignalMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn peers(&self) -> Vec<Uuid> {
        self.peers.read().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<std::collections::HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(std::collections::HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room once its last member left.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer_id = Uuid::new_v4();

        let _rx = group.add_peer(peer_id).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        assert!(group.remove_peer(&peer_id).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.remove_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_concurrent_joins_respect_capacity() {
        let group = Arc::new(BroadcastGroup::new(16));
        let joins = (0..20).map(|_| {
            let group = group.clone();
            tokio::spawn(async move { group.try_add_peer(Uuid::new_v4(), 5).await.is_some() })
        });
        let accepted = futures_util::future::join_all(joins)
            .await
            .into_iter()
            .filter(|joined| *joined.as_ref().unwrap())
            .count();

        assert_eq!(accepted, 5);
        assert_eq!(group.peer_count().await, 5);

        // A member rejoining a full room keeps its seat
        let member = group.peers().await[0];
        assert!(group.try_add_peer(member, 5).await.is_some());
        assert_eq!(group.peer_count().await, 5);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut rx1 = group.add_peer(alice).await;
        let mut rx2 = group.add_peer(Uuid::new_v4()).await;

        let msg = SignalMessage::Join {
            doc_id: Uuid::new_v4(),
            peer_id: alice,
        };
        // Sender filtering is the receiver's job
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let received = rx1.recv().await.unwrap();
        assert_eq!(SignalMessage::decode(&received).unwrap(), msg);
        assert_eq!(SignalMessage::decode(&rx2.recv().await.unwrap()).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let peer_id = Uuid::new_v4();
        let _rx = group.add_peer(peer_id).await;

        let msg = SignalMessage::Leave { peer_id };
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let room1 = manager.get_or_create(doc_id).await;
        let room2 = manager.get_or_create(doc_id).await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get(&doc_id).await.is_some());
        assert_eq!(manager.active_documents().await, vec![doc_id]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let room = manager.get_or_create(doc_id).await;
        let peer_id = Uuid::new_v4();
        let _rx = room.add_peer(peer_id).await;

        assert!(!manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 1);

        room.remove_peer(&peer_id).await;
        assert!(manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 0);
    }
}
