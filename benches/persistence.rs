//! Persistence throughput for the put, claim, and delete cycle.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use logship::{FilePersistence, Log, MemoryPersistence, Persistence};
use serde_json::json;
use tempfile::TempDir;

const GROUP: &str = "bench";
const BATCH: usize = 50;

fn sample(i: usize) -> Log {
    Log::new("event", json!({ "name": "bench", "seq": i, "props": { "screen": "main" } }))
}

/// Store one batch, claim it, and delete it.
fn cycle(store: &mut dyn Persistence, out: &mut Vec<logship::PersistedLog>) {
    for i in 0..BATCH {
        let _ = black_box(store.put_log(GROUP, sample(i)));
    }
    out.clear();
    if let Some(token) = store.get_logs(GROUP, BATCH, out) {
        store.delete_batch(GROUP, &token);
    }
}

fn bench_memory(c: &mut Criterion) {
    let mut store = MemoryPersistence::new(BATCH * 2);
    let mut out = Vec::with_capacity(BATCH);
    c.bench_function("memory_batch_cycle", |b| {
        b.iter(|| cycle(&mut store, &mut out))
    });
}

fn bench_file(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let mut store = FilePersistence::with_capacity(dir.path(), BATCH * 2).expect("open store");
    let mut out = Vec::with_capacity(BATCH);
    c.bench_function("file_batch_cycle", |b| b.iter(|| cycle(&mut store, &mut out)));

    c.bench_function("file_reopen_index", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("temp dir");
                {
                    let mut seed = FilePersistence::open(dir.path()).expect("open store");
                    for i in 0..BATCH {
                        let _ = seed.put_log(GROUP, sample(i));
                    }
                }
                dir
            },
            |dir| {
                let store = FilePersistence::open(dir.path()).expect("reopen store");
                black_box(store.count_logs(GROUP));
            },
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_memory, bench_file);
criterion_main!(benches);
