//! Benchmarks for the storage engine (WAL + tables).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshdb_common::{HlcTimestamp, NodeId};
use meshdb_storage::engine::StorageEngine;
use meshdb_storage::record::OplogEntry;
use meshdb_storage::store::DocumentStore;
use meshdb_storage::wal::FsyncPolicy;
use tempfile::TempDir;

fn ts(wall: i64) -> HlcTimestamp {
    HlcTimestamp::new(wall, 0, NodeId::from("bench-node"))
}

fn body_of(size: usize) -> String {
    format!(r#"{{"payload":"{}"}}"#, "x".repeat(size))
}

fn bench_apply_batch_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_batch_single");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
            let body = body_of(size);

            let mut i = 0i64;
            b.iter(|| {
                let entry = OplogEntry::put("bench", format!("key_{}", i), &body, ts(i));
                engine
                    .apply_batch(vec![entry.to_document()], vec![entry])
                    .unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_get_document(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();

    for i in 0..1000i64 {
        let entry = OplogEntry::put("bench", format!("key_{:04}", i), &body_of(256), ts(i));
        engine
            .apply_batch(vec![entry.to_document()], vec![entry])
            .unwrap();
    }

    c.bench_function("get_document", |b| {
        let mut i = 0i64;
        b.iter(|| {
            let key = format!("key_{:04}", i % 1000);
            black_box(engine.get_document("bench", &key).unwrap());
            i += 1;
        });
    });
}

fn bench_oplog_since(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();

    for i in 0..1000i64 {
        let entry = OplogEntry::put("bench", format!("key_{}", i), "{}", ts(i));
        engine
            .apply_batch(vec![entry.to_document()], vec![entry])
            .unwrap();
    }

    c.bench_function("oplog_since_midpoint", |b| {
        let mid = ts(500);
        b.iter(|| {
            black_box(engine.oplog_since(&mid).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_apply_batch_single,
    bench_get_document,
    bench_oplog_since
);
criterion_main!(benches);
