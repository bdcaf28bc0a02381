//! Awareness channel: ephemeral presence (who is here, where their cursor is).
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! Awareness::set_local_state()   clock += 1
//!       │
//!       ▼
//! AwarenessEntry ──(SyncMessage::Awareness)──► remote Awareness::apply_remote()
//!                                                   │  last-writer-wins by clock
//!                                                   ▼
//!                                              AwarenessChange → listeners
//!
//! Awareness::expire() every check interval: records older than the
//! timeout are dropped and reported as removed exactly once.
//! ```
//!
//! Wire format: `[version]` followed by repeated
//! `[clientId varint][clock varint][payloadLen varint][payload]`.
//! A zero-length payload means the client left.
//!
//! Reference: Kleppmann, Chapter 8 (Broadcast Protocols)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::replica::Anchor;
use crate::update::{write_varint, CodecError, Reader, FORMAT_VERSION};

// ───────────────────────────────────────────────────────────────────
// Presence payload
// ───────────────────────────────────────────────────────────────────

/// RGBA cursor colour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct colour for a client id.
    ///
    /// HSL with high saturation; the hue comes from the id so every
    /// replica renders the same peer in the same colour.
    pub fn from_client_id(client_id: u64) -> Self {
        let hue = ((client_id.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` form used in presence payloads.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Identity shown next to a remote cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl PresenceUser {
    pub fn new(name: impl Into<String>, client_id: u64) -> Self {
        Self {
            name: name.into(),
            color: CursorColor::from_client_id(client_id).to_hex(),
        }
    }
}

/// Typed presence document carried as JSON in an awareness payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PresenceUser>,
    /// Cursor as a CRDT anchor so it follows concurrent edits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Anchor>,
    /// Selected range as `(anchor, head)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<(Anchor, Anchor)>,
}

impl PresenceState {
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// ───────────────────────────────────────────────────────────────────
// Records and wire entries
// ───────────────────────────────────────────────────────────────────

/// One client's presence as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// Empty = explicit removal
    pub payload: Vec<u8>,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A live presence record.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessRecord {
    pub client_id: u64,
    pub clock: u64,
    pub payload: Vec<u8>,
    pub last_seen: Instant,
}

impl AwarenessRecord {
    pub fn presence(&self) -> Option<PresenceState> {
        PresenceState::from_payload(&self.payload).ok()
    }

    fn entry(&self) -> AwarenessEntry {
        AwarenessEntry {
            client_id: self.client_id,
            clock: self.clock,
            payload: self.payload.clone(),
        }
    }
}

/// Client ids whose presence changed in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn extend(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

pub fn encode_entries(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + entries.len() * 16);
    buf.push(FORMAT_VERSION);
    for entry in entries {
        write_varint(&mut buf, entry.client_id);
        write_varint(&mut buf, entry.clock);
        write_varint(&mut buf, entry.payload.len() as u64);
        buf.extend_from_slice(&entry.payload);
    }
    buf
}

pub fn decode_entries(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, CodecError> {
    let mut reader = Reader::new(bytes);
    reader.expect_version()?;
    let mut entries = Vec::new();
    while !reader.is_empty() {
        let client_id = reader.read_varint()?;
        let clock = reader.read_varint()?;
        let len = reader.read_len()?;
        let payload = reader.read_bytes(len)?.to_vec();
        entries.push(AwarenessEntry { client_id, clock, payload });
    }
    Ok(entries)
}

// ───────────────────────────────────────────────────────────────────
// Awareness state machine
// ───────────────────────────────────────────────────────────────────

/// Presence records for one document, keyed by client id.
///
/// Pure state: no timers or I/O. The owning session drives
/// [`Awareness::expire`] and [`Awareness::renew_local`] from its tick.
#[derive(Debug)]
pub struct Awareness {
    local_client: u64,
    records: HashMap<u64, AwarenessRecord>,
    /// Highest clock seen per client; outlives the record so stale
    /// re-deliveries after a removal stay ignored
    clocks: HashMap<u64, u64>,
    timeout: Duration,
}

impl Awareness {
    pub fn new(local_client: u64, timeout: Duration) -> Self {
        Self {
            local_client,
            records: HashMap::new(),
            clocks: HashMap::new(),
            timeout,
        }
    }

    pub fn local_client(&self) -> u64 {
        self.local_client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn local_clock(&self) -> u64 {
        self.clock_of(self.local_client)
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessRecord> {
        self.records.get(&client_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &AwarenessRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Set (or with `None`, clear) the local presence.
    ///
    /// Returns the entry to broadcast and the local change.
    pub fn set_local_state(
        &mut self,
        payload: Option<Vec<u8>>,
        now: Instant,
    ) -> (AwarenessEntry, AwarenessChange) {
        let client_id = self.local_client;
        let clock = self.local_clock() + 1;
        self.clocks.insert(client_id, clock);

        let mut change = AwarenessChange::default();
        let payload = payload.unwrap_or_default();
        if payload.is_empty() {
            if self.records.remove(&client_id).is_some() {
                change.removed.push(client_id);
            }
        } else {
            let record = AwarenessRecord {
                client_id,
                clock,
                payload: payload.clone(),
                last_seen: now,
            };
            match self.records.insert(client_id, record) {
                Some(_) => change.updated.push(client_id),
                None => change.added.push(client_id),
            }
        }

        (AwarenessEntry { client_id, clock, payload }, change)
    }

    /// Apply remote entries, last writer wins by clock.
    ///
    /// Returns the change plus the accepted entries (for relaying).
    pub fn apply_remote(
        &mut self,
        entries: Vec<AwarenessEntry>,
        now: Instant,
    ) -> (AwarenessChange, Vec<AwarenessEntry>) {
        let mut change = AwarenessChange::default();
        let mut accepted = Vec::new();

        for entry in entries {
            if entry.client_id == self.local_client || entry.clock <= self.clock_of(entry.client_id) {
                continue;
            }
            self.clocks.insert(entry.client_id, entry.clock);

            if entry.is_removal() {
                if self.records.remove(&entry.client_id).is_some() {
                    change.removed.push(entry.client_id);
                }
            } else {
                let record = AwarenessRecord {
                    client_id: entry.client_id,
                    clock: entry.clock,
                    payload: entry.payload.clone(),
                    last_seen: now,
                };
                match self.records.insert(entry.client_id, record) {
                    Some(previous) if previous.payload == entry.payload => {}
                    Some(_) => change.updated.push(entry.client_id),
                    None => change.added.push(entry.client_id),
                }
            }
            accepted.push(entry);
        }

        (change, accepted)
    }

    /// Remove remote records not refreshed within the timeout.
    pub fn expire(&mut self, now: Instant) -> AwarenessChange {
        let timeout = self.timeout;
        let local = self.local_client;
        let stale: Vec<u64> = self
            .records
            .values()
            .filter(|r| r.client_id != local && now.duration_since(r.last_seen) >= timeout)
            .map(|r| r.client_id)
            .collect();

        for id in &stale {
            self.records.remove(id);
        }

        AwarenessChange {
            removed: stale,
            ..AwarenessChange::default()
        }
    }

    /// Re-announce the local record once it is `every` old, so remote
    /// replicas refresh it before their timeout.
    pub fn renew_local(&mut self, now: Instant, every: Duration) -> Option<AwarenessEntry> {
        let clock = self.local_clock() + 1;
        let record = self.records.get_mut(&self.local_client)?;
        if now.duration_since(record.last_seen) < every {
            return None;
        }
        record.clock = clock;
        record.last_seen = now;
        let entry = record.entry();
        self.clocks.insert(self.local_client, clock);
        Some(entry)
    }

    /// All current records as wire entries (sent to a newly connected peer).
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        self.records.values().map(AwarenessRecord::entry).collect()
    }

    /// Drop every record (session teardown). Returns the removal and,
    /// when a local record existed, the entry announcing departure.
    pub fn clear(&mut self, now: Instant) -> (AwarenessChange, Option<AwarenessEntry>) {
        let mut change = AwarenessChange::default();
        let departure = if self.records.contains_key(&self.local_client) {
            let (entry, local) = self.set_local_state(None, now);
            change.extend(local);
            Some(entry)
        } else {
            None
        };
        change.removed.extend(self.records.drain().map(|(id, _)| id));
        (change, departure)
    }

    fn clock_of(&self, client_id: u64) -> u64 {
        self.clocks.get(&client_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ItemId;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn entry(client_id: u64, clock: u64, payload: &[u8]) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            clock,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_set_local_state_bumps_clock() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let now = Instant::now();

        let (first, change) = awareness.set_local_state(Some(b"a".to_vec()), now);
        assert_eq!(first.clock, 1);
        assert_eq!(change.added, vec![1]);

        let (second, change) = awareness.set_local_state(Some(b"b".to_vec()), now);
        assert_eq!(second.clock, 2);
        assert_eq!(change.updated, vec![1]);
        assert_eq!(awareness.get(1).unwrap().payload, b"b");
    }

    #[test]
    fn test_clear_local_state_is_removal() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let now = Instant::now();
        awareness.set_local_state(Some(b"a".to_vec()), now);

        let (entry, change) = awareness.set_local_state(None, now);
        assert!(entry.is_removal());
        assert_eq!(entry.clock, 2);
        assert_eq!(change.removed, vec![1]);
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_remote_last_writer_wins() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let now = Instant::now();

        let (change, accepted) = awareness.apply_remote(vec![entry(2, 5, b"new")], now);
        assert_eq!(change.added, vec![2]);
        assert_eq!(accepted.len(), 1);

        let (change, accepted) = awareness.apply_remote(vec![entry(2, 4, b"old"), entry(2, 5, b"dup")], now);
        assert!(change.is_empty());
        assert!(accepted.is_empty());
        assert_eq!(awareness.get(2).unwrap().payload, b"new");

        let (change, _) = awareness.apply_remote(vec![entry(2, 6, b"newer")], now);
        assert_eq!(change.updated, vec![2]);
    }

    #[test]
    fn test_remote_removal_and_stale_readd() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let now = Instant::now();
        awareness.apply_remote(vec![entry(2, 1, b"x")], now);

        let (change, _) = awareness.apply_remote(vec![entry(2, 2, b"")], now);
        assert_eq!(change.removed, vec![2]);

        let (change, _) = awareness.apply_remote(vec![entry(2, 1, b"x")], now);
        assert!(change.is_empty());
        assert!(awareness.get(2).is_none());
    }

    #[test]
    fn test_own_entries_from_remote_are_ignored() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let (change, accepted) = awareness.apply_remote(vec![entry(1, 99, b"echo")], Instant::now());
        assert!(change.is_empty());
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_expiry_fires_once() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let start = Instant::now();
        awareness.set_local_state(Some(b"me".to_vec()), start);
        awareness.apply_remote(vec![entry(2, 1, b"peer")], start);

        assert!(awareness.expire(start + Duration::from_secs(29)).is_empty());

        let change = awareness.expire(start + TIMEOUT);
        assert_eq!(change.removed, vec![2]);
        assert!(awareness.expire(start + TIMEOUT * 2).is_empty());

        // Local record never expires locally.
        assert!(awareness.get(1).is_some());
    }

    #[test]
    fn test_renew_local_after_renewal_interval() {
        let every = Duration::from_secs(15);
        let mut awareness = Awareness::new(1, TIMEOUT);
        let start = Instant::now();
        assert!(awareness.renew_local(start, every).is_none());

        awareness.set_local_state(Some(b"me".to_vec()), start);
        assert!(awareness.renew_local(start + Duration::from_secs(10), every).is_none());

        let renewed = awareness.renew_local(start + every, every).unwrap();
        assert_eq!(renewed.clock, 2);
        assert_eq!(renewed.payload, b"me");

        // The interval restarts from the renewal
        assert!(awareness.renew_local(start + Duration::from_secs(20), every).is_none());
        assert!(awareness.renew_local(start + Duration::from_secs(5), Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_clear_announces_departure() {
        let mut awareness = Awareness::new(1, TIMEOUT);
        let now = Instant::now();
        awareness.set_local_state(Some(b"me".to_vec()), now);
        awareness.apply_remote(vec![entry(2, 1, b"peer")], now);

        let (change, departure) = awareness.clear(now);
        let departure = departure.unwrap();
        assert!(departure.is_removal());
        assert_eq!(departure.client_id, 1);

        let mut removed = change.removed.clone();
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_entries_roundtrip() {
        let entries = vec![entry(1, 3, b"{\"a\":1}"), entry(u64::MAX, 1, b"")];
        assert_eq!(decode_entries(&encode_entries(&entries)).unwrap(), entries);
    }

    #[test]
    fn test_decode_entries_rejects_truncation() {
        let bytes = encode_entries(&[entry(7, 2, b"payload")]);
        assert!(decode_entries(&bytes[..bytes.len() - 1]).is_err());
        assert_eq!(decode_entries(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_presence_state_payload() {
        let state = PresenceState {
            user: Some(PresenceUser::new("Alice", 7)),
            cursor: Some(Anchor { item: Some(ItemId::new(7, 3)) }),
            selection: Some((Anchor { item: Some(ItemId::new(7, 1)) }, Anchor::END)),
        };
        let parsed = PresenceState::from_payload(&state.to_payload().unwrap()).unwrap();
        assert_eq!(parsed, state);
        assert!(parsed.user.unwrap().color.starts_with('#'));

        // Payloads without a selection still parse
        let bare = PresenceState::from_payload(br#"{"cursor":{"item":null}}"#).unwrap();
        assert_eq!(bare.cursor, Some(Anchor::END));
        assert_eq!(bare.selection, None);
    }

    #[test]
    fn test_cursor_color_stable() {
        assert_eq!(CursorColor::from_client_id(42), CursorColor::from_client_id(42));
        assert_eq!(CursorColor::from_client_id(42).to_hex().len(), 7);
    }
}
