//! Commit-path microbenchmarks: single-worker read and update
//! transactions against each protocol family's representative.

use bedrock::{MvtoEngine, NoWaitEngine, SiloEngine, Tx};
use bedrock_core::Schema;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

const T: u64 = 1;
const KEYS: u64 = 1024;

fn schema() -> Arc<Schema> {
    Schema::builder().table(T, 64).freeze()
}

fn bench_silo(c: &mut Criterion) {
    let engine = SiloEngine::new(schema(), 1);
    let record = [7u8; 64];
    for k in 0..KEYS {
        engine.load(T, k, &record);
    }
    let worker = engine.worker(0);

    let mut key = 0u64;
    c.bench_function("silo_read_commit", |b| {
        b.iter(|| {
            key = (key + 1) % KEYS;
            let mut tx = Tx::begin(&worker);
            black_box(tx.get(T, key).unwrap());
            tx.commit().unwrap();
        })
    });
    c.bench_function("silo_update_commit", |b| {
        b.iter(|| {
            key = (key + 1) % KEYS;
            let mut tx = Tx::begin(&worker);
            tx.prepare_update(T, key).unwrap()[0] = key as u8;
            tx.commit().unwrap();
        })
    });
}

fn bench_mvto(c: &mut Criterion) {
    let engine = MvtoEngine::new(schema(), 1);
    let record = [7u8; 64];
    for k in 0..KEYS {
        engine.load(T, k, &record);
    }
    let worker = engine.worker(0);

    let mut key = 0u64;
    c.bench_function("mvto_update_commit", |b| {
        b.iter(|| {
            key = (key + 1) % KEYS;
            let mut tx = Tx::begin(&worker);
            tx.prepare_update(T, key).unwrap()[0] = key as u8;
            tx.commit().unwrap();
            engine.timestamps().publish_watermarks();
        })
    });
}

fn bench_nowait(c: &mut Criterion) {
    let engine = NoWaitEngine::new(schema(), 1);
    let record = [7u8; 64];
    for k in 0..KEYS {
        engine.load(T, k, &record);
    }
    let worker = engine.worker(0);

    let mut key = 0u64;
    c.bench_function("nowait_update_commit", |b| {
        b.iter(|| {
            key = (key + 1) % KEYS;
            let mut tx = Tx::begin(&worker);
            tx.prepare_update(T, key).unwrap()[0] = key as u8;
            tx.commit().unwrap();
        })
    });
}

criterion_group!(benches, bench_silo, bench_mvto, bench_nowait);
criterion_main!(benches);
