//! Envelope protocol for peer links.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬────────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ compressed │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ 1 byte     │ variable │
//! └──────────┴───────────┴──────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! The payload is one of the versioned binary bodies from
//! [`crate::update`] / [`crate::awareness`], or a bincode [`PeerInfo`].
//! Payloads above the session's compression threshold are LZ4
//! compressed; [`SyncMessage::decode`] always returns them inflated.
//!

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::{self, AwarenessEntry, CursorColor};
use crate::replica::StateVector;
use crate::update::{CodecError, Update};

/// Message types for the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the receiver answers with SyncStep2
    SyncStep1 = 1,
    /// Delta computed against the state vector of a SyncStep1
    SyncStep2 = 2,
    /// Incremental update (local edit or relay)
    Update = 3,
    /// Awareness entries
    Awareness = 4,
    /// Hello: first frame on a link, carries PeerInfo
    PeerJoined = 5,
    /// Courtesy departure notice
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#rrggbb` colour for cursor rendering
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        let (high, low) = peer_id.as_u64_pair();
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_client_id(high ^ low).to_hex(),
        }
    }
}

/// Top-level envelope for every frame on a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender's local document clock (Lamport)
    pub clock: u64,
    /// Payload is LZ4 compressed with a prepended size
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            compressed: false,
            payload,
        }
    }

    /// State vector announcement / resync request.
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, clock: u64, state_vector: &StateVector) -> Self {
        Self::with_payload(MessageType::SyncStep1, peer_id, doc_id, clock, state_vector.encode())
    }

    /// Answer to a SyncStep1.
    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, clock: u64, update: &Update) -> Self {
        Self::with_payload(MessageType::SyncStep2, peer_id, doc_id, clock, update.encode())
    }

    /// Incremental update.
    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, update: &Update) -> Self {
        Self::with_payload(MessageType::Update, peer_id, doc_id, clock, update.encode())
    }

    pub fn awareness(peer_id: Uuid, doc_id: Uuid, entries: &[AwarenessEntry]) -> Self {
        Self::with_payload(MessageType::Awareness, peer_id, doc_id, 0, awareness::encode_entries(entries))
    }

    /// Hello frame identifying the dialing peer and the document.
    pub fn peer_joined(peer_id: Uuid, doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::with_payload(MessageType::PeerJoined, peer_id, doc_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, doc_id, 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, doc_id, 0, Vec::new())
    }

    /// LZ4-compress the payload when it exceeds `threshold` bytes.
    pub fn compress_above(mut self, threshold: usize) -> Self {
        if !self.compressed && self.payload.len() > threshold {
            self.payload = lz4_flex::compress_prepend_size(&self.payload);
            self.compressed = true;
        }
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format, inflating compressed payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (mut msg, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if msg.compressed {
            msg.payload = lz4_flex::decompress_size_prepended(&msg.payload)
                .map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            msg.compressed = false;
        }
        Ok(msg)
    }

    /// Parse a SyncStep1 payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect(&[MessageType::SyncStep1])?;
        Ok(StateVector::decode(&self.payload)?)
    }

    /// Parse a SyncStep2 / Update payload.
    pub fn document_update(&self) -> Result<Update, ProtocolError> {
        self.expect(&[MessageType::SyncStep2, MessageType::Update])?;
        Ok(Update::decode(&self.payload)?)
    }

    pub fn awareness_entries(&self) -> Result<Vec<AwarenessEntry>, ProtocolError> {
        self.expect(&[MessageType::Awareness])?;
        Ok(awareness::decode_entries(&self.payload)?)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(&[MessageType::PeerJoined])?;
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    fn expect(&self, types: &[MessageType]) -> Result<(), ProtocolError> {
        if types.contains(&self.msg_type) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    Codec(CodecError),
    InvalidMessageType,
    /// Frame addressed to another document
    WrongDocument(Uuid),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::CompressionError(e) => write!(f, "Compression error: {e}"),
            Self::Codec(e) => write!(f, "Codec error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::WrongDocument(doc_id) => write!(f, "Frame for unexpected document {doc_id}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        ProtocolError::Codec(e)
    }
}
