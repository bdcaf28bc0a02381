//! Binary codec for document updates and state vectors.
//!
//! Wire format (all integers LEB128 varints unless noted):
//! ```text
//! Update
//! ┌─────────┬─────────────┬───────────────────────────────────────┬───────────┬──────────────┐
//! │ version │ clientCount │ per client: clientId itemCount items… │ delCount  │ delIds…      │
//! │ 1 byte  │ varint      │                                       │ varint    │ client clock │
//! └─────────┴─────────────┴───────────────────────────────────────┴───────────┴──────────────┘
//!
//! item: clock │ leftPresent(u8) [client clock] │ rightPresent(u8) [client clock] │ len │ bytes
//!
//! StateVector
//! ┌─────────┬───────┬──────────────────────┐
//! │ version │ count │ (clientId, clock)…   │
//! └─────────┴───────┴──────────────────────┘
//! ```
//!
//! An absent origin is the single byte `0`; the document start and end
//! need no id of their own.

use std::fmt;

use crate::replica::{Item, ItemId, ReplicaStore, StateVector};

/// Leading byte of every encoded update, state vector and awareness message.
pub const FORMAT_VERSION: u8 = 1;

/// Items and deletions a peer is missing.
///
/// Items are kept sorted by `(client, clock)` so that integration
/// applies each client's items in causal order and so that
/// `decode(encode(u)) == u`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub items: Vec<Item>,
    pub deletions: Vec<ItemId>,
}

impl Update {
    pub fn new(mut items: Vec<Item>, mut deletions: Vec<ItemId>) -> Self {
        items.sort_by_key(|item| item.id);
        items.dedup_by_key(|item| item.id);
        deletions.sort();
        deletions.dedup();
        Self { items, deletions }
    }

    /// Everything in `store` that a replica at `since` is missing.
    ///
    /// Deletions cannot be summarised by a state vector, so the full
    /// tombstone set is included; re-applying a known deletion is a no-op.
    /// The cost grows with every tombstone ever created. Sessions strip
    /// the deletions a link has already exchanged before sending.
    pub fn diff(store: &ReplicaStore, since: &StateVector) -> Self {
        let items = store
            .items_since(since)
            .map(|item| Item {
                deleted: false,
                ..item.clone()
            })
            .collect();
        Self::new(items, store.tombstones().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletions.is_empty()
    }

    /// Highest clock per client among the carried items.
    pub fn state_vector(&self) -> StateVector {
        self.items
            .iter()
            .map(|item| (item.id.client, item.id.clock))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.items.len() * 8);
        buf.push(FORMAT_VERSION);

        let groups = group_by_client(&self.items);
        write_varint(&mut buf, groups.len() as u64);
        for (client, items) in groups {
            write_varint(&mut buf, client);
            write_varint(&mut buf, items.len() as u64);
            for item in items {
                write_varint(&mut buf, item.id.clock);
                write_origin(&mut buf, item.left_origin);
                write_origin(&mut buf, item.right_origin);
                write_varint(&mut buf, item.content.len() as u64);
                buf.extend_from_slice(item.content.as_bytes());
            }
        }

        write_varint(&mut buf, self.deletions.len() as u64);
        for id in &self.deletions {
            write_id(&mut buf, *id);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        reader.expect_version()?;

        let client_count = reader.read_len()?;
        let mut items = Vec::with_capacity(client_count.min(reader.remaining()));
        for _ in 0..client_count {
            let client = reader.read_varint()?;
            let item_count = reader.read_len()?;
            for _ in 0..item_count {
                let clock = reader.read_clock()?;
                let left_origin = reader.read_origin()?;
                let right_origin = reader.read_origin()?;
                let len = reader.read_len()?;
                let content = std::str::from_utf8(reader.read_bytes(len)?).map_err(|_| CodecError::InvalidUtf8)?;
                let mut chars = content.chars();
                let (Some(ch), None) = (chars.next(), chars.next()) else {
                    return Err(CodecError::NotOneChar(len));
                };
                items.push(Item::new(ItemId::new(client, clock), ch, left_origin, right_origin));
            }
        }

        let deletion_count = reader.read_len()?;
        let mut deletions = Vec::with_capacity(deletion_count.min(reader.remaining()));
        for _ in 0..deletion_count {
            deletions.push(reader.read_id()?);
        }

        reader.finish()?;
        Ok(Self::new(items, deletions))
    }
}

impl StateVector {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.len() * 4);
        buf.push(FORMAT_VERSION);
        write_varint(&mut buf, self.len() as u64);
        for (client, clock) in self.iter() {
            write_varint(&mut buf, client);
            write_varint(&mut buf, clock);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        reader.expect_version()?;
        let count = reader.read_len()?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let client = reader.read_varint()?;
            let clock = reader.read_varint()?;
            sv.set(client, clock);
        }
        reader.finish()?;
        Ok(sv)
    }
}

fn group_by_client(items: &[Item]) -> Vec<(u64, &[Item])> {
    let mut groups = Vec::new();
    let mut start = 0;
    for end in 1..=items.len() {
        if end == items.len() || items[end].id.client != items[start].id.client {
            groups.push((items[start].id.client, &items[start..end]));
            start = end;
        }
    }
    groups
}

fn write_origin(buf: &mut Vec<u8>, origin: Option<ItemId>) {
    match origin {
        Some(id) => {
            buf.push(1);
            write_id(buf, id);
        }
        None => buf.push(0),
    }
}

fn write_id(buf: &mut Vec<u8>, id: ItemId) {
    write_varint(buf, id.client);
    write_varint(buf, id.clock);
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Cursor over an encoded message.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn expect_version(&mut self) -> Result<(), CodecError> {
        match self.read_u8()? {
            FORMAT_VERSION => Ok(()),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self.bytes.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift == 63 && bits > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// A length or count; must fit in the remaining input.
    pub(crate) fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_varint()?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or(CodecError::LengthOverflow(len))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.bytes.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_clock(&mut self) -> Result<u64, CodecError> {
        match self.read_varint()? {
            0 => Err(CodecError::InvalidClock),
            clock => Ok(clock),
        }
    }

    fn read_id(&mut self) -> Result<ItemId, CodecError> {
        let client = self.read_varint()?;
        let clock = self.read_clock()?;
        Ok(ItemId::new(client, clock))
    }

    fn read_origin(&mut self) -> Result<Option<ItemId>, CodecError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => self.read_id().map(Some),
            flag => Err(CodecError::InvalidFlag(flag)),
        }
    }

    pub(crate) fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }
}

/// Malformed or truncated update / state vector / awareness bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    UnsupportedVersion(u8),
    UnexpectedEof,
    VarintOverflow,
    LengthOverflow(u64),
    InvalidFlag(u8),
    InvalidClock,
    InvalidUtf8,
    /// Item content must be exactly one character
    NotOneChar(usize),
    TrailingBytes(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "Unsupported format version {v}"),
            Self::UnexpectedEof => write!(f, "Unexpected end of input"),
            Self::VarintOverflow => write!(f, "Varint overflows u64"),
            Self::LengthOverflow(len) => write!(f, "Length {len} exceeds remaining input"),
            Self::InvalidFlag(flag) => write!(f, "Invalid origin flag {flag}"),
            Self::InvalidClock => write!(f, "Clock 0 is reserved"),
            Self::InvalidUtf8 => write!(f, "Content is not valid UTF-8"),
            Self::NotOneChar(len) => write!(f, "Item content of {len} bytes is not a single character"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes"),
        }
    }
}

impl std::error::Error for CodecError {}
