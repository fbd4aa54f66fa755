use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use rayon::prelude::*;
use segmap::ConcurrentMap;
use std::collections::HashMap;

const ITER: usize = 32 * 1024;

/// Number of pairs preloaded for the lookup and delete benchmarks.
const NUMBER: usize = 100_000;

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{}", i)).collect()
}

fn filled(keys: &[String]) -> ConcurrentMap<usize> {
    let map = ConcurrentMap::new(keys.len() / 4).unwrap();
    for (i, key) in keys.iter().enumerate() {
        map.put(key.as_str(), i).unwrap();
    }
    map
}

fn put_absent(c: &mut Criterion) {
    let keys = keys(ITER);
    let mut group = c.benchmark_group("put_absent");
    group.throughput(Throughput::Elements(ITER as u64));
    group.bench_function("segmap", |b| {
        b.iter(|| {
            let map = ConcurrentMap::new(16).unwrap();
            for (i, key) in keys.iter().enumerate() {
                map.put(key.as_str(), i).unwrap();
            }
            map
        })
    });
    group.bench_function("std", |b| {
        b.iter(|| {
            let mut map = HashMap::new();
            for (i, key) in keys.iter().enumerate() {
                map.insert(key.clone(), i);
            }
            map
        })
    });
    group.finish();
}

fn put_present(c: &mut Criterion) {
    let map = ConcurrentMap::new(5).unwrap();
    map.put("invariable key", 0).unwrap();
    let mut i = 0;
    c.bench_function("put_present", |b| {
        b.iter(|| {
            i += 1;
            map.put("invariable key", black_box(i)).unwrap()
        })
    });
}

fn put_parallel(c: &mut Criterion) {
    let keys = keys(ITER);
    let mut group = c.benchmark_group("put_parallel");
    group.throughput(Throughput::Elements(ITER as u64));

    for threads in 1..=num_cpus::get() {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| {
                    b.iter(|| {
                        let map = ConcurrentMap::new(64).unwrap();
                        keys.par_iter().enumerate().for_each(|(i, key)| {
                            map.put(key.as_str(), i).unwrap();
                        });
                        map
                    })
                });
            },
        );
    }

    group.finish();
}

fn get(c: &mut Criterion) {
    let keys = keys(NUMBER);
    let map = filled(&keys);
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("get");
    for _ in 0..10 {
        let key = keys.choose(&mut rng).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(key), key, |b, key| {
            b.iter(|| map.get(black_box(key)))
        });
    }
    group.finish();
}

fn delete(c: &mut Criterion) {
    let keys = keys(NUMBER);
    let map = filled(&keys);
    let mut rng = StdRng::seed_from_u64(0);
    c.bench_function("delete", |b| {
        b.iter_batched(
            || {
                let key = keys.choose(&mut rng).unwrap().clone();
                map.put(key.as_str(), 0).unwrap();
                key
            },
            |key| map.delete(&key).unwrap(),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, put_absent, put_present, put_parallel, get, delete);
criterion_main!(benches);
