//! Benchmarks for Get-Together reconciliation
//!
//! Run with: cargo bench -p gettogether-core
//!
//! These benchmarks establish performance baselines for:
//! - Message ingestion with re-sort on every arrival
//! - Bulk sync ingestion
//! - Conversation merges
//! - Presence sweeps over many contacts

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gettogether_core::account::AccountState;
use gettogether_core::observe::SnapshotHub;
use gettogether_core::persist::{LoadedState, PersistHandle};
use gettogether_core::{
    ContactId, DomainEvent, Message, MessageLog, PresenceSignal, PresenceTracker, ReconcilerConfig,
};

fn messages(count: usize) -> Vec<Message> {
    // Deliberately out of order: odd ids arrive with older timestamps
    (0..count)
        .map(|i| {
            let ts = if i % 2 == 0 { i as i64 * 10 } else { (count - i) as i64 * 10 };
            Message::new(format!("m{i:06}"), "c1", "alice", Some(ts), "payload")
        })
        .collect()
}

fn account_state() -> AccountState {
    AccountState::new(
        "me".into(),
        &ReconcilerConfig::default(),
        Arc::new(SnapshotHub::new()),
        PersistHandle::new(),
        LoadedState::default(),
    )
}

// ============================================================================
// Message Ordering Benchmarks
// ============================================================================

fn bench_message_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_insert");

    for size in [100usize, 1_000] {
        let input = messages(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("one_by_one", size), &input, |b, input| {
            b.iter_batched(
                || input.clone(),
                |batch| {
                    let mut log = MessageLog::new();
                    for message in batch {
                        log.insert(message);
                    }
                    black_box(log.len())
                },
                criterion::BatchSize::SmallInput,
            )
        });
        group.bench_with_input(BenchmarkId::new("bulk", size), &input, |b, input| {
            b.iter_batched(
                || input.clone(),
                |batch| {
                    let mut log = MessageLog::new();
                    black_box(log.extend(batch))
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_duplicate_absorption(c: &mut Criterion) {
    let mut log = MessageLog::new();
    log.extend(messages(1_000));
    let duplicate = Message::new("m000500", "c1", "alice", Some(5_000), "payload");

    c.bench_function("duplicate_into_1000", |b| {
        b.iter(|| black_box(log.insert(duplicate.clone())))
    });
}

// ============================================================================
// Conversation Merge Benchmarks
// ============================================================================

fn bench_conversation_merge(c: &mut Criterion) {
    let participants = vec![ContactId::from("me"), ContactId::from("alice")];

    c.bench_function("merge_two_500_message_conversations", |b| {
        b.iter_batched(
            || {
                let mut left = messages(1_000);
                let right = left.split_off(500);
                (account_state(), left, right)
            },
            |(mut state, left, right)| {
                state.handle_event(
                    DomainEvent::ConversationSync {
                        conversation_id: "left".into(),
                        participants: participants.clone(),
                        messages: left,
                    },
                    0,
                );
                state.handle_event(
                    DomainEvent::ConversationSync {
                        conversation_id: "right".into(),
                        participants: participants.clone(),
                        messages: right,
                    },
                    0,
                );
                black_box(state.conversations().len())
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

// ============================================================================
// Presence Benchmarks
// ============================================================================

fn bench_presence_sweep(c: &mut Criterion) {
    c.bench_function("sweep_1000_contacts", |b| {
        b.iter_batched(
            || {
                let mut tracker = PresenceTracker::new(60_000);
                for i in 0..1_000i64 {
                    tracker.apply(
                        &PresenceSignal::Activity {
                            contact_id: ContactId::new(format!("c{i}")),
                            at: i * 100,
                        },
                        i * 100,
                    );
                }
                tracker
            },
            |mut tracker| black_box(tracker.sweep(120_000).len()),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_message_insert,
    bench_duplicate_absorption,
    bench_conversation_merge,
    bench_presence_sweep,
);
criterion_main!(benches);
