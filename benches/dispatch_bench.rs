//! Benchmarks for upsert registration and dispatch

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use upsert_bridge::engine::{EngineBatch, MemoryEngine};
use upsert_bridge::ffi::{callbacks, BridgeResult, SizeLayout, UpsertBatch, UpsertOptions};
use upsert_bridge::upsert::{bind, UpsertRegistration};

/// Benchmark handle lookup against a populated registry
fn bench_lookup(c: &mut Criterion) {
    let handles: Vec<_> = (0..1024)
        .map(|_| callbacks().register(|_: &mut UpsertBatch<'_>| true))
        .collect();
    let probe = handles[512];

    c.bench_function("registry_lookup", |b| {
        b.iter(|| black_box(callbacks().lookup(black_box(probe))))
    });

    for handle in handles {
        callbacks().unregister(handle);
    }
}

/// Benchmark register + unregister churn
fn bench_register(c: &mut Criterion) {
    c.bench_function("register_unregister", |b| {
        b.iter(|| {
            let handle = callbacks().register(|_: &mut UpsertBatch<'_>| true);
            callbacks().unregister(black_box(handle));
        })
    });
}

/// Benchmark a full engine round trip for varying batch sizes
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let registration = UpsertRegistration::with_options(
        |batch: &mut UpsertBatch<'_>| -> BridgeResult<()> {
            for i in 0..batch.count() {
                let incoming = batch.upsert.get(i).and_then(|r| r.bytes()).unwrap_or(&[]).to_vec();
                batch.result.write(i, &incoming)?;
            }
            Ok(())
        },
        UpsertOptions::per_record(),
    );
    let mut engine = MemoryEngine::new("db").with_layout(SizeLayout::PerRecord);
    let keys = engine.slot_keys("bench");
    bind(&mut engine, &keys, &registration).unwrap();

    for &size in &[1usize, 8, 64, 512] {
        let batch = EngineBatch::merge(vec![vec![0u8; 16]; size], vec![vec![1u8; 16]; size]);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("{}_records", size), |b| {
            b.iter(|| black_box(engine.upsert("bench", &batch)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_register, bench_dispatch);
criterion_main!(benches);
