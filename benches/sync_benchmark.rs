use boardsync::awareness::{color_for_user, AwarenessState, LocalAwareness, PresenceTable};
use boardsync::board::{BoardDocument, BoardOp, StickyNote, StickyPatch};
use boardsync::client::OfflineQueue;
use boardsync::protocol::{PeerInfo, SyncMessage};
use boardsync::room::Room;
use boardsync::store::{SnapshotStore, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use uuid::Uuid;

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let board = Uuid::new_v4();
    let delta = vec![0u8; 64]; // Typical small delta

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(
                black_box(peer),
                black_box(board),
                black_box(1),
                black_box(delta.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let board = Uuid::new_v4();
    let msg = SyncMessage::delta(peer, board, 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let board = Uuid::new_v4();
    let mut state = AwarenessState::new("u-bench", "Bench User");
    state.cursor = Some(boardsync::awareness::CursorPos { x: 100.0, y: 200.0 });
    state.selection = vec!["sticky-1".to_string()];

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(
                black_box(peer),
                black_box(board),
                black_box(1),
                black_box(&state),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_peer_info_creation(c: &mut Criterion) {
    c.bench_function("peer_info_new", |b| {
        b.iter(|| {
            black_box(PeerInfo::new(black_box("u-test"), black_box("TestUser")));
        })
    });
}

// ─── Document benchmarks ────────────────────────────────────────

fn bench_op_to_delta(c: &mut Criterion) {
    let mut doc = BoardDocument::new(Uuid::new_v4());
    let sticky = StickyNote::new("u-bench");
    let id = sticky.id.clone();
    doc.apply_op(&BoardOp::CreateSticky(sticky)).unwrap();

    c.bench_function("op_to_delta_sticky_move", |b| {
        let mut x = 0.0;
        b.iter(|| {
            x += 1.0;
            let op = BoardOp::UpdateSticky {
                id: id.clone(),
                patch: StickyPatch {
                    x: Some(x),
                    y: Some(x * 0.5),
                    ..StickyPatch::default()
                },
            };
            black_box(doc.apply_op(black_box(&op)).unwrap());
        })
    });
}

fn bench_delta_merge(c: &mut Criterion) {
    let board_id = Uuid::new_v4();
    let delta = {
        let mut source = BoardDocument::new(board_id);
        source
            .apply_op(&BoardOp::CreateSticky(StickyNote::new("u-bench")))
            .unwrap()
    };

    c.bench_function("delta_merge_create_sticky", |b| {
        b.iter_batched(
            || BoardDocument::new(board_id),
            |mut doc| {
                doc.merge_remote_delta(black_box(&delta)).unwrap();
                black_box(doc);
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_full_state_encode_1k(c: &mut Criterion) {
    let mut doc = BoardDocument::new(Uuid::new_v4());
    for _ in 0..1000 {
        doc.apply_op(&BoardOp::CreateSticky(StickyNote::new("u-bench")))
            .unwrap();
    }

    c.bench_function("full_state_encode_1K_stickies", |b| {
        b.iter(|| {
            black_box(doc.encode_full_state());
        })
    });
}

fn bench_catch_up_diff(c: &mut Criterion) {
    let mut doc = BoardDocument::new(Uuid::new_v4());
    for _ in 0..500 {
        doc.apply_op(&BoardOp::CreateSticky(StickyNote::new("u-bench")))
            .unwrap();
    }
    // A replica that saw the first half
    let halfway = doc.state_vector();
    for _ in 0..500 {
        doc.apply_op(&BoardOp::CreateSticky(StickyNote::new("u-bench")))
            .unwrap();
    }

    c.bench_function("catch_up_diff_500_behind", |b| {
        b.iter(|| {
            black_box(doc.encode_diff(black_box(&halfway)).unwrap());
        })
    });
}

// ─── Room fan-out benchmarks ────────────────────────────────────

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(BoardDocument::new(Uuid::new_v4()), 1024);

                // Add 100 peers
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("u-{i}"), format!("Peer{i}"));
                    let rx = room.join(peer).await.unwrap();
                    receivers.push(rx);
                }

                // Broadcast 1 message
                let data = Arc::new(vec![0u8; 64]);
                let count = room.broadcast_raw(black_box(data));
                black_box(count);
            });
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(BoardDocument::new(Uuid::new_v4()), 2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("u-{i}"), format!("Peer{i}"));
                    let rx = room.join(peer).await.unwrap();
                    receivers.push(rx);
                }

                // Broadcast 1000 messages
                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 64]);
                    room.broadcast_raw(black_box(data));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            let drained = queue.drain();
            black_box(drained);
        })
    });
}

// ─── Awareness benchmarks ───────────────────────────────────────

fn bench_color_for_user(c: &mut Criterion) {
    c.bench_function("color_for_user", |b| {
        b.iter(|| {
            black_box(color_for_user(black_box("user-3f2a81cc")));
        })
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    let peer = Uuid::new_v4();

    c.bench_function("presence_apply", |b| {
        b.iter_custom(|iters| {
            let mut table = PresenceTable::new();
            let mut state = AwarenessState::new("u-remote", "Remote");

            let start = std::time::Instant::now();
            for i in 0..iters {
                state.cursor = Some(boardsync::awareness::CursorPos {
                    x: i as f64,
                    y: i as f64 * 0.5,
                });
                table.apply(peer, state.clone());
            }
            start.elapsed()
        })
    });
}

fn bench_cursor_throttle(c: &mut Criterion) {
    // Mostly hits the rate-limit fast path, like a real pointer stream
    c.bench_function("cursor_throttle_stream", |b| {
        b.iter_custom(|iters| {
            let mut local = LocalAwareness::new("u-local", "Local");

            let start = std::time::Instant::now();
            for i in 0..iters {
                let update = local.set_cursor(i as f64, i as f64 * 0.5);
                black_box(update);
            }
            start.elapsed()
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────────

fn board_state_with_stickies(count: usize) -> Vec<u8> {
    let mut doc = BoardDocument::new(Uuid::new_v4());
    for i in 0..count {
        let mut sticky = StickyNote::new("u-bench");
        sticky.text = format!("note {i}: talk through the rollout plan");
        sticky.x = i as f64 * 20.0;
        sticky.y = i as f64 * 10.0;
        doc.apply_op(&BoardOp::CreateSticky(sticky)).unwrap();
    }
    doc.encode_full_state()
}

fn bench_save_snapshot(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("boardsync_bench_save_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        // No fsync in the loop: measure codec + engine
        sync_writes: false,
        ..StoreConfig::default()
    };
    let store = SnapshotStore::open(config).unwrap();
    let board_id = Uuid::new_v4();
    let state = board_state_with_stickies(100);

    c.bench_function("save_snapshot_100_stickies", |b| {
        b.iter(|| {
            store
                .save_snapshot(black_box(board_id), black_box(&state))
                .unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_load_snapshot(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("boardsync_bench_load_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        sync_writes: false,
        ..StoreConfig::default()
    };
    let store = SnapshotStore::open(config).unwrap();
    let board_id = Uuid::new_v4();
    let state = board_state_with_stickies(100);
    store.save_snapshot(board_id, &state).unwrap();

    c.bench_function("load_snapshot_100_stickies", |b| {
        b.iter(|| {
            black_box(store.get_latest_snapshot(black_box(board_id)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_lz4_board_state(c: &mut Criterion) {
    let state = board_state_with_stickies(1000);

    c.bench_function("lz4_compress_1K_sticky_state", |b| {
        b.iter(|| {
            black_box(lz4_flex::compress_prepend_size(black_box(&state)));
        })
    });

    let compressed = lz4_flex::compress_prepend_size(&state);
    c.bench_function("lz4_decompress_1K_sticky_state", |b| {
        b.iter(|| {
            black_box(lz4_flex::decompress_size_prepended(black_box(&compressed)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_awareness_encode,
    bench_peer_info_creation,
    bench_op_to_delta,
    bench_delta_merge,
    bench_full_state_encode_1k,
    bench_catch_up_diff,
    bench_broadcast_raw,
    bench_broadcast_1000_messages,
    bench_offline_queue,
    bench_color_for_user,
    bench_presence_apply,
    bench_cursor_throttle,
    bench_save_snapshot,
    bench_load_snapshot,
    bench_lz4_board_state,
);
criterion_main!(benches);
