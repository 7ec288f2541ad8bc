//! Benchmarks for per-call strategy overhead

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use polycache::prelude::*;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn signature() -> FnSignature {
    FnSignature::new("lookup").param("id")
}

fn plain_call() -> WrappedCall<String> {
    wrap_fn(|args: CallArgs| async move {
        Ok(args.positionals().first().cloned().unwrap_or_default())
    })
}

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(MemoryConfig::with_capacity(100_000)))
}

fn bench_simple(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = SimpleCache::<String, _>::builder(backend(), signature(), "1h")
        .build()
        .unwrap();
    let cached = cache.wrap(plain_call());

    // Pre-populate the hit key
    rt.block_on(async {
        cached(CallArgs::new().positional(1)).await.unwrap();
    });

    let mut group = c.benchmark_group("simple");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = cached(black_box(CallArgs::new().positional(1)))
                    .await
                    .unwrap();
                black_box(value);
            });
        });
    });

    group.bench_function("miss_store", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            rt.block_on(async {
                // Unique key per iteration keeps every call on the miss path
                let value = cached(black_box(CallArgs::new().positional(i)))
                    .await
                    .unwrap();
                black_box(value);
            });
        });
    });

    group.finish();
}

fn bench_soft(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = SoftCache::<String, _>::builder(backend(), signature(), "1h")
        .soft_ttl(Duration::from_secs(1800))
        .build()
        .unwrap();
    let cached = cache.wrap(plain_call());

    rt.block_on(async {
        cached(CallArgs::new().positional(1)).await.unwrap();
    });

    let mut group = c.benchmark_group("soft");
    group.throughput(Throughput::Elements(1));

    // Decoding the freshness envelope is the extra cost over a plain hit
    group.bench_function("fresh_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = cached(black_box(CallArgs::new().positional(1)))
                    .await
                    .unwrap();
                black_box(value);
            });
        });
    });

    group.finish();
}

fn bench_stack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let baseline = plain_call();

    let backend = backend();
    let strategies: Vec<Arc<dyn Strategy<String>>> = vec![
        Arc::new(
            CircuitBreaker::builder(backend.clone(), signature())
                .build()
                .unwrap(),
        ),
        Arc::new(
            RateLimiter::builder(backend.clone(), signature(), 1_000_000_000, "1h")
                .build()
                .unwrap(),
        ),
        Arc::new(
            SimpleCache::<String, _>::builder(backend, signature(), "1h")
                .build()
                .unwrap(),
        ),
    ];
    let stacked = stack(&strategies, plain_call());

    rt.block_on(async {
        stacked(CallArgs::new().positional(1)).await.unwrap();
    });

    let mut group = c.benchmark_group("stack");
    group.throughput(Throughput::Elements(1));

    group.bench_function("uncached_call", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = baseline(black_box(CallArgs::new().positional(1)))
                    .await
                    .unwrap();
                black_box(value);
            });
        });
    });

    group.bench_function("circuit_rate_cache_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = stacked(black_box(CallArgs::new().positional(1)))
                    .await
                    .unwrap();
                black_box(value);
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_simple, bench_soft, bench_stack);
criterion_main!(benches);
