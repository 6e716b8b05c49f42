//! Engine operation benchmarks over anonymous memory.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pmkv_bench::utils::{generate_keys, populated_store, random_data, volatile_store, ENGINES};
use std::ops::ControlFlow;

const KEYS: usize = 10_000;

/// Benchmark puts that overwrite a fixed key set, so the pool never fills.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    let keys = generate_keys(KEYS);

    for kind in ENGINES {
        for size in [64usize, 1024] {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(kind.name(), size),
                &size,
                |b, &size| {
                    let store = volatile_store(kind);
                    let value = random_data(size);
                    let mut i = 0;
                    b.iter(|| {
                        store.put(&keys[i % KEYS], black_box(&value)).unwrap();
                        i += 1;
                    });
                },
            );
        }
    }
    group.finish();
}

/// Benchmark point reads of present keys.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let keys = generate_keys(KEYS);

    for kind in ENGINES {
        let store = populated_store(kind, &keys, 256);
        group.bench_function(kind.name(), |b| {
            let mut i = 0;
            b.iter(|| {
                let value = store.get(black_box(&keys[i % KEYS])).unwrap();
                i += 1;
                value
            });
        });
    }
    group.finish();
}

/// Benchmark full iteration.
fn bench_get_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_all");
    let keys = generate_keys(KEYS);
    group.throughput(Throughput::Elements(KEYS as u64));

    for kind in ENGINES {
        let store = populated_store(kind, &keys, 64);
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let mut bytes = 0usize;
                store
                    .get_all(|k, v| {
                        bytes += k.len() + v.len();
                        ControlFlow::Continue(())
                    })
                    .unwrap();
                black_box(bytes)
            });
        });
    }
    group.finish();
}

/// Benchmark range counts on the ordered engines.
fn bench_count_between(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_between");
    let keys = generate_keys(KEYS);

    for kind in ENGINES.into_iter().filter(|k| k.is_ordered()) {
        let store = populated_store(kind, &keys, 16);
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let low: &[u8] = b"user000000002000";
                let high: &[u8] = b"user000000003000";
                store
                    .count_between(black_box(low), black_box(high))
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_get_all, bench_count_between);
criterion_main!(benches);
