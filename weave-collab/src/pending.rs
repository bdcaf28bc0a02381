//! Causal buffer for items and deletions that arrived too early.
//!
//! An entry waits here until every dependency has been integrated. Each
//! successful integration retries the buffer until no further progress
//! is possible. Entries that wait past the configured bounds are dropped
//! and their source peers are asked for a full resync instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::replica::{DiffOp, Integrated, Item, ItemId, ReplicaStore};
use crate::update::Update;

/// Bounds after which buffered entries are abandoned for a resync.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferLimits {
    pub max_entries: usize,
    pub max_age: Duration,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Waiting<T> {
    value: T,
    source: Option<Uuid>,
    since: Instant,
}

/// What a merge changed in the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Merged {
    /// Newly integrated items, in integration order
    pub items: Vec<Item>,
    /// Newly applied deletions
    pub deletions: Vec<ItemId>,
    /// Live content diff for the editor
    pub ops: Vec<DiffOp>,
    /// Unit count of the trailing insert op, for coalescing
    tail_units: usize,
}

impl Merged {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletions.is_empty()
    }

    /// The newly applied changes as an update for other peers.
    pub fn to_update(&self) -> Update {
        Update::new(self.items.clone(), self.deletions.clone())
    }

    fn inserted(&mut self, item: Item, index: usize) {
        match self.ops.last_mut() {
            Some(DiffOp::Insert { index: start, text }) if *start + self.tail_units == index => {
                text.push_str(&item.content);
                self.tail_units += 1;
            }
            _ => {
                self.ops.push(DiffOp::Insert {
                    index,
                    text: item.content.clone(),
                });
                self.tail_units = 1;
            }
        }
        self.items.push(item);
    }

    fn deleted(&mut self, id: ItemId, index: usize) {
        match self.ops.last_mut() {
            Some(DiffOp::Delete { index: start, len }) if *start == index => *len += 1,
            _ => self.ops.push(DiffOp::Delete { index, len: 1 }),
        }
        self.deletions.push(id);
    }
}

/// Holds entries whose causal dependencies are not yet integrated.
#[derive(Debug)]
pub struct CausalBuffer {
    items: Vec<Waiting<Item>>,
    deletions: Vec<Waiting<ItemId>>,
    limits: BufferLimits,
}

impl CausalBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            items: Vec::new(),
            deletions: Vec::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_items(&self) -> usize {
        self.items.len()
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletions.len()
    }

    /// Integrate an update, buffering whatever is not yet applicable.
    pub fn merge(
        &mut self,
        store: &mut ReplicaStore,
        update: Update,
        source: Option<Uuid>,
        now: Instant,
    ) -> Merged {
        let mut merged = Merged::default();
        let mut progressed = false;

        for item in update.items {
            if store.contains(&item.id) || self.items.iter().any(|w| w.value.id == item.id) {
                continue;
            }
            if store.missing_dependency(&item).is_some() {
                self.items.push(Waiting { value: item, source, since: now });
                continue;
            }
            progressed |= apply_item(store, item, &mut merged);
        }
        if progressed {
            self.drain_items(store, &mut merged);
        }

        for id in update.deletions {
            if self.deletions.iter().any(|w| w.value == id) {
                continue;
            }
            match store.integrate_deletion(id) {
                Ok(Some(index)) => merged.deleted(id, index),
                Ok(None) => {}
                Err(gap) => {
                    log::trace!("Buffering deletion: {gap}");
                    self.deletions.push(Waiting { value: id, source, since: now });
                }
            }
        }
        if !merged.items.is_empty() {
            self.drain_deletions(store, &mut merged);
        }

        merged
    }

    /// Drop entries past the bounds; returns the peers to resync from.
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let overflow = self.len() > self.limits.max_entries;
        let max_age = self.limits.max_age;
        let mut sources = Vec::new();

        let mut keep = |source: Option<Uuid>, since: Instant| {
            if overflow || now.duration_since(since) >= max_age {
                if let Some(peer) = source {
                    if !sources.contains(&peer) {
                        sources.push(peer);
                    }
                }
                false
            } else {
                true
            }
        };
        self.items.retain(|w| keep(w.source, w.since));
        self.deletions.retain(|w| keep(w.source, w.since));

        sources
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.deletions.clear();
    }

    fn drain_items(&mut self, store: &mut ReplicaStore, merged: &mut Merged) {
        loop {
            let mut progressed = false;
            let mut still_waiting = Vec::with_capacity(self.items.len());
            for waiting in std::mem::take(&mut self.items) {
                if store.missing_dependency(&waiting.value).is_some() {
                    still_waiting.push(waiting);
                } else {
                    progressed |= apply_item(store, waiting.value, merged);
                }
            }
            self.items = still_waiting;
            if !progressed || self.items.is_empty() {
                break;
            }
        }
    }

    fn drain_deletions(&mut self, store: &mut ReplicaStore, merged: &mut Merged) {
        let waiting = std::mem::take(&mut self.deletions);
        for entry in waiting {
            match store.integrate_deletion(entry.value) {
                Ok(Some(index)) => merged.deleted(entry.value, index),
                Ok(None) => {}
                Err(_) => self.deletions.push(entry),
            }
        }
    }
}

impl Default for CausalBuffer {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}

fn apply_item(store: &mut ReplicaStore, item: Item, merged: &mut Merged) -> bool {
    match store.integrate(item.clone()) {
        Ok(Integrated::Inserted { index }) => {
            merged.inserted(item, index);
            true
        }
        Ok(Integrated::Duplicate) => false,
        Err(gap) => {
            log::debug!("Integration deferred: {gap}");
            false
        }
    }
}
