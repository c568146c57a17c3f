use criterion::{black_box, criterion_group, criterion_main, Criterion};

use confab::protocol::{ServerEnvelope, WireMessage};
use confab::registry::{ConnectionHandle, ConnectionRegistry};
use confab::store::MessageLog;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use uuid::Uuid;

fn wire_message(content_len: usize) -> WireMessage {
    WireMessage {
        id: Uuid::new_v4(),
        room_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        display_name: "Bencher".into(),
        content: "x".repeat(content_len),
        timestamp: 1_700_000_000_000,
        is_system: false,
    }
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = ServerEnvelope::MessageBroadcast(wire_message(256));

    c.bench_function("envelope_encode_256B", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = ServerEnvelope::MessageBroadcast(wire_message(256))
        .encode()
        .unwrap();

    c.bench_function("envelope_decode_256B", |b| {
        b.iter(|| {
            black_box(ServerEnvelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_room_fanout_100_peers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let registry = ConnectionRegistry::new();
    let room_id = Uuid::new_v4();

    // Keep receivers alive so frames are accepted, not dropped.
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..100 {
            let (tx, rx) = mpsc::channel(4096);
            receivers.push(rx);
            registry
                .register(Arc::new(ConnectionHandle::new(
                    Uuid::new_v4(),
                    room_id,
                    format!("Peer{i}"),
                    tx,
                )))
                .await;
        }
    });

    let envelope = ServerEnvelope::MessageBroadcast(wire_message(64));

    c.bench_function("fanout_100_peers_64B", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    registry
                        .broadcast_to_room(room_id, black_box(&envelope), None)
                        .await,
                );
                // Drain so the bounded buffers never fill up.
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            });
        })
    });
}

fn bench_message_log_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let log = MessageLog::new();
    let room_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    c.bench_function("message_log_append_64B", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    log.append(room_id, user_id, "Bencher", "y".repeat(64))
                        .await,
                );
            });
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_room_fanout_100_peers,
    bench_message_log_append
);
criterion_main!(benches);
