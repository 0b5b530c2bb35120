//! Performance benchmarks for the mutation pipeline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rollbook::{
    diff, Actor, AuditAction, AuditRecorder, Clock, ConcurrencyController, Fields, ManualClock,
    MemoryStore, MutationCommand, MutationQueue, QueueConfig, RateLimitPolicy, RateLimiter,
    Timestamp,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Timestamp(0)))
}

fn row(n: usize) -> Fields {
    json!({"name": format!("Siswa {}", n), "class": "7A", "score": n % 100})
        .as_object()
        .cloned()
        .unwrap()
}

/// Enqueue cost, in memory and with a journal
fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    let actor = Actor::new("u-1", "Guru");

    group.bench_function("in_memory", |b| {
        let queue = MutationQueue::in_memory(clock());
        let mut n = 0;
        b.iter(|| {
            n += 1;
            black_box(
                queue
                    .enqueue(actor.clone(), MutationCommand::create("students", format!("s-{}", n), row(n)))
                    .unwrap(),
            );
        });
    });

    group.bench_function("journaled", |b| {
        let dir = TempDir::new().unwrap();
        let queue = MutationQueue::open(
            QueueConfig {
                journal_path: Some(dir.path().join("bench.journal")),
                ..Default::default()
            },
            clock(),
            None,
        )
        .unwrap();
        let mut n = 0;
        b.iter(|| {
            n += 1;
            black_box(
                queue
                    .enqueue(actor.clone(), MutationCommand::create("students", format!("s-{}", n), row(n)))
                    .unwrap(),
            );
        });
    });

    group.finish();
}

/// Dispatch a full queue against the in-process store
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let runtime = Runtime::new().unwrap();
    let actor = Actor::new("u-1", "Guru");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("queue_size", size), &size, |b, &size| {
            b.iter(|| {
                let clock = clock();
                let remote = Arc::new(MemoryStore::new(Arc::clone(&clock), RateLimitPolicy::default()));
                let controller = ConcurrencyController::new(remote, RateLimitPolicy::default(), Arc::clone(&clock));
                let queue = MutationQueue::in_memory(clock);
                for n in 0..size {
                    queue
                        .enqueue(actor.clone(), MutationCommand::create("students", format!("s-{}", n), row(n)))
                        .unwrap();
                }
                black_box(runtime.block_on(queue.dispatch(&controller)).unwrap());
            });
        });
    }

    group.finish();
}

/// Sliding-window checks with a populated window
fn bench_rate_limit(c: &mut Criterion) {
    let limiter = RateLimiter::new(clock());
    for _ in 0..50 {
        limiter.check("u-1", "bulk_insert", 1000, 1);
    }

    c.bench_function("rate_limit_peek", |b| {
        b.iter(|| black_box(limiter.peek("u-1", "bulk_insert", 1000, 1)));
    });
}

/// Audit queries and diffs with history
fn bench_audit(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit");
    let recorder = AuditRecorder::new(clock());
    let actor = Actor::new("u-1", "Guru");

    for n in 0..10_000 {
        let record_id = format!("g-{}", n % 100);
        recorder
            .append(&actor, "grades", &record_id, AuditAction::Update, Some(row(n)), Some(row(n + 1)))
            .unwrap();
    }

    group.bench_function("query_record", |b| {
        b.iter(|| black_box(recorder.query("grades", Some("g-42"), 50)));
    });

    let latest = recorder.query("grades", None, 1).remove(0);
    group.bench_function("diff", |b| {
        b.iter(|| black_box(diff(&latest)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_dispatch,
    bench_rate_limit,
    bench_audit,
);

criterion_main!(benches);
