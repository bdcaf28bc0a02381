//! Replica store: the CRDT state of one shared text document.
//!
//! Items live in a flat arena kept in document order. Origins are stored
//! as [`ItemId`]s rather than references, so the structure never needs
//! shared ownership or back-pointers.
//!
//! ```text
//!   items (document order, tombstones kept)
//!   ┌──────┬──────┬──────┬──────┬──────┐
//!   │ a    │ 1    │ ✝x   │ 2    │ b    │
//!   │ 0:1  │ 1:1  │ 3:1  │ 2:1  │ 0:2  │
//!   └──────┴──────┴──────┴──────┴──────┘
//!      ▲                          ▲
//!      └── left origin of "1" ────┴── right origin of "1"
//! ```
//!
//! Concurrent inserts between the same neighbours are ordered with the
//! YATA rule: scan the span between the origins, skip past items whose
//! origin chain places them before us, and break ties on equal left
//! origins by client id (lower id first).
//!
//! Reference: Nicolaescu et al., Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types (YATA), GROUP 2016

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Globally unique identifier of an inserted content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    /// Replica that created the item
    pub client: u64,
    /// Per-client logical clock, starting at 1
    pub clock: u64,
}

impl ItemId {
    pub fn new(client: u64, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.clock)
    }
}

/// One inserted character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub content: String,
    /// Neighbour to the left at insertion time (None = document start)
    pub left_origin: Option<ItemId>,
    /// Neighbour to the right at insertion time (None = document end)
    pub right_origin: Option<ItemId>,
    /// Tombstone flag; the only mutable field of an item
    pub deleted: bool,
}

impl Item {
    pub fn new(
        id: ItemId,
        content: impl Into<String>,
        left_origin: Option<ItemId>,
        right_origin: Option<ItemId>,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            left_origin,
            right_origin,
            deleted: false,
        }
    }
}

/// Per-client summary of the highest clock integrated so far.
///
/// Clocks are contiguous per client (causal delivery guarantees that
/// clock `n` is only integrated after `n - 1`), so "has item" reduces
/// to a single comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<u64, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen for `client` (0 when unknown).
    pub fn get(&self, client: u64) -> u64 {
        self.0.get(&client).copied().unwrap_or(0)
    }

    /// Raise the clock for `client`; never lowers it.
    pub fn set(&mut self, client: u64, clock: u64) {
        let entry = self.0.entry(client).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        id.clock != 0 && self.get(id.client) >= id.clock
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in other.iter() {
            self.set(client, clock);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().map(|(client, clock)| (*client, *clock))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u64, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.set(client, clock);
        }
        sv
    }
}

/// A change to the live content, expressed in live unit positions.
///
/// Ops in a sequence are applied in order; each index is valid against
/// the content produced by the previous ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

/// Result of integrating a remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrated {
    /// Placed at this live index
    Inserted { index: usize },
    /// Already known; nothing changed
    Duplicate,
}

/// Position that follows the content it was taken at, not an index.
///
/// Points at an item (the unit right of the cursor) or at the
/// document end. Survives concurrent inserts and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub item: Option<ItemId>,
}

impl Anchor {
    pub const END: Anchor = Anchor { item: None };
}

/// A dependency of an item or deletion is not integrated yet.
///
/// Never surfaced to API callers: the document session buffers the
/// offending entry until the gap closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalGap {
    /// An earlier clock from the same client is missing
    MissingClock { client: u64, expected: u64, got: u64 },
    /// The left or right origin has not arrived
    MissingOrigin(ItemId),
    /// A deletion targets an item that has not arrived
    UnknownItem(ItemId),
}

impl fmt::Display for CausalGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingClock { client, expected, got } => {
                write!(f, "client {client}: expected clock {expected}, got {got}")
            }
            Self::MissingOrigin(id) => write!(f, "origin {id} not integrated"),
            Self::UnknownItem(id) => write!(f, "deleted item {id} not integrated"),
        }
    }
}

impl std::error::Error for CausalGap {}

/// Errors from local edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    IndexOutOfRange { index: usize, len: usize },
}

impl fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index, len } => {
                write!(f, "Index {index} out of range (live length {len})")
            }
        }
    }
}

impl std::error::Error for ReplicaError {}

/// CRDT state for one document: items in order plus the state vector.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    client_id: u64,
    items: Vec<Item>,
    state_vector: StateVector,
    live_len: usize,
    tombstones: usize,
}

impl ReplicaStore {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            items: Vec::new(),
            state_vector: StateVector::new(),
            live_len: 0,
            tombstones: 0,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Local logical clock (highest clock this replica has authored).
    pub fn clock(&self) -> u64 {
        self.state_vector.get(self.client_id)
    }

    /// Number of live content units.
    pub fn len(&self) -> usize {
        self.live_len
    }

    pub fn is_empty(&self) -> bool {
        self.live_len == 0
    }

    /// Total items held, tombstones included.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.state_vector.contains(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.position(id).map(|pos| &self.items[pos])
    }

    /// Insert one character so it occupies live position `index`.
    pub fn insert(&mut self, index: usize, ch: char) -> Result<ItemId, ReplicaError> {
        if index > self.live_len {
            return Err(ReplicaError::IndexOutOfRange {
                index,
                len: self.live_len,
            });
        }

        let pos = self.boundary(index);
        let left = pos.checked_sub(1).map(|p| self.items[p].id);
        let right = self.items.get(pos).map(|item| item.id);
        let id = ItemId::new(self.client_id, self.clock() + 1);

        self.place(pos, Item::new(id, ch, left, right));
        Ok(id)
    }

    /// Insert `text` one character per item starting at `index`.
    pub fn insert_text(&mut self, index: usize, text: &str) -> Result<Vec<ItemId>, ReplicaError> {
        if index > self.live_len {
            return Err(ReplicaError::IndexOutOfRange {
                index,
                len: self.live_len,
            });
        }
        text.chars()
            .enumerate()
            .map(|(offset, ch)| self.insert(index + offset, ch))
            .collect()
    }

    /// Tombstone `len` live units starting at `index`.
    pub fn delete(&mut self, index: usize, len: usize) -> Result<Vec<ItemId>, ReplicaError> {
        let end = match index.checked_add(len) {
            Some(end) if end <= self.live_len => end,
            _ => {
                return Err(ReplicaError::IndexOutOfRange {
                    index: index.saturating_add(len),
                    len: self.live_len,
                })
            }
        };

        let mut removed = Vec::with_capacity(len);
        let mut seen = 0;
        for item in self.items.iter_mut().filter(|item| !item.deleted) {
            if seen >= end {
                break;
            }
            if seen >= index {
                item.deleted = true;
                removed.push(item.id);
            }
            seen += 1;
        }

        self.live_len -= removed.len();
        self.tombstones += removed.len();
        Ok(removed)
    }

    /// First unmet dependency of `item`, if any.
    pub fn missing_dependency(&self, item: &Item) -> Option<CausalGap> {
        let expected = self.state_vector.get(item.id.client) + 1;
        if item.id.clock > expected {
            return Some(CausalGap::MissingClock {
                client: item.id.client,
                expected,
                got: item.id.clock,
            });
        }
        [item.left_origin, item.right_origin]
            .into_iter()
            .flatten()
            .find(|origin| !self.contains(origin))
            .map(CausalGap::MissingOrigin)
    }

    /// Integrate a remote item at its conflict-resolved position.
    pub fn integrate(&mut self, item: Item) -> Result<Integrated, CausalGap> {
        if self.contains(&item.id) {
            return Ok(Integrated::Duplicate);
        }
        if let Some(gap) = self.missing_dependency(&item) {
            return Err(gap);
        }

        let left_pos = match item.left_origin {
            Some(origin) => Some(self.position(&origin).ok_or(CausalGap::MissingOrigin(origin))?),
            None => None,
        };
        let right_pos = match item.right_origin {
            Some(origin) => self.position(&origin).ok_or(CausalGap::MissingOrigin(origin))?,
            None => self.items.len(),
        };

        let start = left_pos.map_or(0, |pos| pos + 1);
        let mut dest = start;
        let mut before_origin = HashSet::new();
        let mut conflicting = HashSet::new();

        for scan in start..right_pos {
            let other = &self.items[scan];
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.left_origin == item.left_origin {
                // Same left origin: lower client id goes first.
                if other.id.client < item.id.client {
                    dest = scan + 1;
                    conflicting.clear();
                } else if other.right_origin == item.right_origin {
                    break;
                }
            } else if let Some(origin) = other.left_origin.filter(|o| before_origin.contains(o)) {
                // Other hangs off an item inside the scanned span: it
                // belongs to a subtree that precedes us unless its origin
                // is still an unresolved conflict.
                if !conflicting.contains(&origin) {
                    dest = scan + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        let index = self.live_index(dest);
        self.place(dest, item);
        Ok(Integrated::Inserted { index })
    }

    /// Tombstone a remote deletion. `Ok(None)` when already deleted.
    pub fn integrate_deletion(&mut self, id: ItemId) -> Result<Option<usize>, CausalGap> {
        let pos = self.position(&id).ok_or(CausalGap::UnknownItem(id))?;
        if self.items[pos].deleted {
            return Ok(None);
        }

        let index = self.live_index(pos);
        self.items[pos].deleted = true;
        self.live_len -= 1;
        self.tombstones += 1;
        Ok(Some(index))
    }

    /// Lazy walk over live content in document order.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            items: self.items.iter(),
        }
    }

    /// Live content as one string.
    pub fn text(&self) -> String {
        self.snapshot().collect()
    }

    /// Items with clocks above `since`, in document order.
    pub fn items_since<'a>(&'a self, since: &'a StateVector) -> impl Iterator<Item = &'a Item> + 'a {
        self.items
            .iter()
            .filter(move |item| item.id.clock > since.get(item.id.client))
    }

    /// Ids of all tombstoned items.
    pub fn tombstones(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.items.iter().filter(|item| item.deleted).map(|item| item.id)
    }

    /// Anchor for the unit currently at live `index` (end when past it).
    pub fn anchor_at(&self, index: usize) -> Anchor {
        Anchor {
            item: self
                .items
                .iter()
                .filter(|item| !item.deleted)
                .nth(index)
                .map(|item| item.id),
        }
    }

    /// Live index an anchor currently points at.
    ///
    /// A tombstoned anchor resolves to where its unit used to be.
    /// Returns `None` for an anchor on an item this replica has not seen.
    pub fn resolve_anchor(&self, anchor: &Anchor) -> Option<usize> {
        match anchor.item {
            None => Some(self.live_len),
            Some(id) => self.position(&id).map(|pos| self.live_index(pos)),
        }
    }

    fn position(&self, id: &ItemId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.items.iter().position(|item| item.id == *id)
    }

    /// Arena position right after the `index`-th live unit.
    fn boundary(&self, index: usize) -> usize {
        if index == 0 {
            return 0;
        }
        let mut seen = 0;
        for (pos, item) in self.items.iter().enumerate() {
            if !item.deleted {
                seen += 1;
                if seen == index {
                    return pos + 1;
                }
            }
        }
        self.items.len()
    }

    fn live_index(&self, pos: usize) -> usize {
        self.items[..pos].iter().filter(|item| !item.deleted).count()
    }

    fn place(&mut self, pos: usize, item: Item) {
        self.state_vector.set(item.id.client, item.id.clock);
        if item.deleted {
            self.tombstones += 1;
        } else {
            self.live_len += 1;
        }
        self.items.insert(pos, item);
    }
}

/// Restartable iterator over live content units.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    items: std::slice::Iter<'a, Item>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.items
            .by_ref()
            .find(|item| !item.deleted)
            .map(|item| item.content.as_str())
    }
}
