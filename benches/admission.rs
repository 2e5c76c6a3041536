//! Benchmarks for the limiter admission and snapshot paths.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flowgate::{
    Algorithm, AlgorithmParameters, MemoryStore, PolicyConfig, PolicyFactory, RateLimiter,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn build(algorithm: Algorithm, max_requests: u64) -> Arc<dyn RateLimiter> {
    let factory = PolicyFactory::new(Arc::new(MemoryStore::new()));
    factory
        .create(
            PolicyConfig::new("bench", algorithm, max_requests, Duration::from_secs(3600))
                .with_parameters(
                    AlgorithmParameters::new()
                        .with_capacity(max_requests as f64)
                        .with_refill_rate(1_000_000.0)
                        .with_leak_rate(1_000_000.0),
                ),
        )
        .unwrap()
}

fn bench_admit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("limiter/admit");

    let cases = [
        (Algorithm::TokenBucket, 1_000_000_000),
        (Algorithm::LeakyBucket, 1_000_000_000),
        (Algorithm::FixedWindow, 1_000_000_000),
        // Kept saturated so the retained entry list stays bounded.
        (Algorithm::SlidingWindow, 100),
    ];

    for (algorithm, max_requests) in cases {
        group.bench_with_input(
            BenchmarkId::from_parameter(algorithm),
            &algorithm,
            |b, _| {
                let limiter = build(algorithm, max_requests);
                b.iter(|| {
                    let admitted = runtime
                        .block_on(limiter.admit("bench-key", 1, None))
                        .unwrap();
                    black_box(admitted);
                });
            },
        );
    }

    group.finish();
}

fn bench_state(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("limiter/state");

    for algorithm in [Algorithm::TokenBucket, Algorithm::FixedWindow] {
        group.bench_with_input(
            BenchmarkId::from_parameter(algorithm),
            &algorithm,
            |b, _| {
                let limiter = build(algorithm, 1_000_000_000);
                runtime
                    .block_on(limiter.admit("bench-key", 1, None))
                    .unwrap();
                b.iter(|| {
                    let state = runtime.block_on(limiter.state("bench-key")).unwrap();
                    black_box(state);
                });
            },
        );
    }

    group.finish();
}

fn bench_contended_admit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("limiter/admit_contended");

    group.bench_function("token_bucket_16_tasks", |b| {
        let limiter = build(Algorithm::TokenBucket, 1_000_000_000);
        b.iter(|| {
            runtime.block_on(async {
                let mut handles = Vec::with_capacity(16);
                for _ in 0..16 {
                    let limiter = Arc::clone(&limiter);
                    handles.push(tokio::spawn(async move {
                        limiter.admit("hot-key", 1, None).await.unwrap()
                    }));
                }
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_admit, bench_state, bench_contended_admit);
criterion_main!(benches);
