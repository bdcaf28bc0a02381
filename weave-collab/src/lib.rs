//! # weave-collab: Peer-to-peer collaborative text editing
//!
//! Replicates a plain-text document between peers with a YATA sequence
//! CRDT. There is no central authority: every peer holds a full replica,
//! edits apply locally at once, and replicas that have seen the same
//! operations hold the same text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   local edits   ┌──────────────────┐
//! │ EditorWidget │ ──────────────► │ BindingAdapter   │
//! │  (external)  │ ◄────────────── │                  │
//! └──────────────┘   remote diffs  └────────┬─────────┘
//!                                           │
//!                                           ▼
//!                       ┌──────────────────────────────────┐
//!                       │ DocumentSession (one task)       │
//!                       │  ReplicaStore · Awareness ·      │
//!                       │  CausalBuffer                    │
//!                       └───┬──────────────┬───────────┬───┘
//!                           │              │           │
//!                      PeerHandle     PeerHandle   PeerHandle
//!                           │              │           │
//!                      FrameLink (WebSocket or in-memory)
//! ```
//!
//! Peers find each other through a signaling server ([`signaling`]) that
//! only relays `Join`/`PeerOffer`/`PeerAnswer`/`Leave`; document content
//! flows directly between peers.
//!
//! ## Modules
//!
//! - [`replica`]: CRDT store (items, tombstones, state vectors, anchors)
//! - [`update`]: Binary update and state vector codec
//! - [`pending`]: Causal buffer for updates that arrive early
//! - [`awareness`]: Ephemeral presence with last-writer-wins and expiry
//! - [`protocol`]: Peer link envelope (bincode-encoded `SyncMessage`)
//! - [`transport`]: Frame links over WebSocket or in-process channels
//! - [`peer`]: Per-peer link tasks with reconnect backoff
//! - [`session`]: Document session actor
//! - [`binding`]: Editor widget adapter
//! - [`broadcast`] / [`signaling`]: Discovery rooms, server and client
//! - [`node`]: Document registry and inbound link routing
//! - [`config`]: Session tuning knobs

pub mod replica;
pub mod update;
pub mod pending;
pub mod awareness;
pub mod protocol;
pub mod config;
pub mod transport;
pub mod peer;
pub mod session;
pub mod binding;
pub mod broadcast;
pub mod signaling;
pub mod node;

// Re-exports for convenience
pub use replica::{Anchor, DiffOp, Item, ItemId, ReplicaError, ReplicaStore, StateVector};
pub use update::{CodecError, Update, FORMAT_VERSION};
pub use pending::{BufferLimits, CausalBuffer};
pub use awareness::{
    Awareness, AwarenessChange, AwarenessEntry, AwarenessRecord, CursorColor,
    PresenceState, PresenceUser,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use config::SessionConfig;
pub use transport::{Connector, FrameLink, MemoryNetwork, TransportError, WsConnector};
pub use session::{
    AwarenessHandle, DocumentSession, PresenceEvent, RemoteChange, RemoteCursor,
    SessionError, SessionStatus,
};
pub use binding::{BindingAdapter, EditOrigin, EditorWidget, WidgetEdit};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use signaling::{
    ConnectionState, SignalEvent, SignalMessage, SignalingClient, SignalingConfig,
    SignalingServer, SignalingStats,
};
pub use node::{CollabNode, NodeConfig};
