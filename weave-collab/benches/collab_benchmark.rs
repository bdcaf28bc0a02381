use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use weave_collab::awareness::{decode_entries, encode_entries};
use weave_collab::{
    Awareness, AwarenessEntry, BroadcastGroup, BufferLimits, CausalBuffer, PeerInfo,
    ReplicaStore, StateVector, SyncMessage, Update,
};

/// A replica holding `len` characters typed left to right by one client.
fn typed(client: u64, len: usize) -> ReplicaStore {
    let mut store = ReplicaStore::new(client);
    let text: String = "lorem ipsum ".chars().cycle().take(len).collect();
    store.insert_text(0, &text).unwrap();
    store
}

fn bench_local_insert_1000(c: &mut Criterion) {
    c.bench_function("local_insert_1000_chars", |b| {
        b.iter(|| {
            let mut store = ReplicaStore::new(1);
            for i in 0..1000 {
                store.insert(black_box(i), 'x').unwrap();
            }
            black_box(store.len());
        })
    });
}

fn bench_integrate_remote_1000(c: &mut Criterion) {
    let update = Update::diff(&typed(2, 1000), &StateVector::new());

    c.bench_function("integrate_remote_1000_items", |b| {
        b.iter(|| {
            let mut store = ReplicaStore::new(1);
            let mut buffer = CausalBuffer::new(BufferLimits::default());
            let merged = buffer.merge(&mut store, black_box(update.clone()), None, Instant::now());
            black_box(merged);
        })
    });
}

fn bench_concurrent_merge(c: &mut Criterion) {
    // Two clients typing at the same position
    let left = Update::diff(&typed(1, 200), &StateVector::new());
    let right = Update::diff(&typed(2, 200), &StateVector::new());

    c.bench_function("merge_concurrent_200x2", |b| {
        b.iter(|| {
            let mut store = ReplicaStore::new(3);
            let mut buffer = CausalBuffer::new(BufferLimits::default());
            buffer.merge(&mut store, left.clone(), None, Instant::now());
            buffer.merge(&mut store, right.clone(), None, Instant::now());
            black_box(store.len());
        })
    });
}

fn bench_update_encode(c: &mut Criterion) {
    let update = Update::diff(&typed(1, 1000), &StateVector::new());

    c.bench_function("update_encode_1000_items", |b| {
        b.iter(|| black_box(black_box(&update).encode()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Update::diff(&typed(1, 1000), &StateVector::new()).encode();

    c.bench_function("update_decode_1000_items", |b| {
        b.iter(|| black_box(Update::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut store = typed(1, 10_000);
    store.delete(100, 5_000).unwrap();

    c.bench_function("snapshot_10k_items_half_tombstoned", |b| {
        b.iter(|| black_box(store.text()))
    });
}

fn bench_sync_message_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let update = Update::diff(&typed(1, 64), &StateVector::new());

    c.bench_function("sync_message_update_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box(doc), black_box(1), &update);
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_sync_message_compressed(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let update = Update::diff(&typed(1, 4096), &StateVector::new());
    let encoded = SyncMessage::sync_step2(peer, doc, 1, &update)
        .compress_above(1024)
        .encode()
        .unwrap();

    c.bench_function("sync_message_step2_4k_decode_lz4", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let entries: Vec<AwarenessEntry> = (1..=100)
        .map(|client_id| AwarenessEntry {
            client_id,
            clock: 1,
            payload: br#"{"user":{"name":"peer","color":"#336699"}}"#.to_vec(),
        })
        .collect();
    let encoded = encode_entries(&entries);

    c.bench_function("awareness_decode_apply_100", |b| {
        b.iter(|| {
            let mut awareness = Awareness::new(0, Duration::from_secs(30));
            let entries = decode_entries(black_box(&encoded)).unwrap();
            black_box(awareness.apply_remote(entries, Instant::now()));
        })
    });
}

fn bench_peer_info_creation(c: &mut Criterion) {
    c.bench_function("peer_info_new", |b| {
        b.iter(|| {
            black_box(PeerInfo::new(black_box("TestUser")));
        })
    });
}

fn bench_broadcast_1000_signals(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_signals_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 64]);
                    group.broadcast_raw(black_box(data));
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_local_insert_1000,
    bench_integrate_remote_1000,
    bench_concurrent_merge,
    bench_update_encode,
    bench_update_decode,
    bench_snapshot,
    bench_sync_message_encode,
    bench_sync_message_compressed,
    bench_awareness_apply,
    bench_peer_info_creation,
    bench_broadcast_1000_signals,
);
criterion_main!(benches);
