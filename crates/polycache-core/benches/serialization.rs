//! Benchmarks for serializer implementations

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use polycache_core::{JsonSerializer, Serializer, SoftEntry};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::time::Duration;

#[cfg(feature = "msgpack")]
use polycache_core::MsgPackSerializer;

#[cfg(feature = "bincode")]
use polycache_core::BincodeSerializer;

/// Test data structure for benchmarking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
    scores: Vec<i32>,
}

impl Profile {
    fn small() -> Self {
        Self {
            id: 12345,
            name: "test".to_string(),
            scores: vec![1, 2, 3],
        }
    }

    fn large() -> Self {
        Self {
            id: 12345,
            name: "x".repeat(256),
            scores: (0..1000).collect(),
        }
    }
}

fn bench_serialize(c: &mut Criterion) {
    let cases = vec![("small", Profile::small()), ("large", Profile::large())];

    let mut group = c.benchmark_group("serialize");

    for (name, data) in &cases {
        group.bench_with_input(BenchmarkId::new("json", name), data, |b, data| {
            let serializer = JsonSerializer;
            b.iter(|| {
                let bytes = serializer.serialize(black_box(data)).unwrap();
                black_box(bytes);
            });
        });

        #[cfg(feature = "msgpack")]
        group.bench_with_input(BenchmarkId::new("msgpack", name), data, |b, data| {
            let serializer = MsgPackSerializer;
            b.iter(|| {
                let bytes = serializer.serialize(black_box(data)).unwrap();
                black_box(bytes);
            });
        });

        #[cfg(feature = "bincode")]
        group.bench_with_input(BenchmarkId::new("bincode", name), data, |b, data| {
            let serializer = BincodeSerializer;
            b.iter(|| {
                let bytes = serializer.serialize(black_box(data)).unwrap();
                black_box(bytes);
            });
        });
    }

    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let cases = vec![("small", Profile::small()), ("large", Profile::large())];

    let mut group = c.benchmark_group("deserialize");

    for (name, data) in &cases {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(data).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("json", name), &bytes, |b, bytes| {
            b.iter(|| {
                let result: Profile = serializer.deserialize(black_box(bytes)).unwrap();
                black_box(result);
            });
        });

        #[cfg(feature = "msgpack")]
        {
            let serializer = MsgPackSerializer;
            let bytes = serializer.serialize(data).unwrap();
            group.throughput(Throughput::Bytes(bytes.len() as u64));
            group.bench_with_input(BenchmarkId::new("msgpack", name), &bytes, |b, bytes| {
                b.iter(|| {
                    let result: Profile = serializer.deserialize(black_box(bytes)).unwrap();
                    black_box(result);
                });
            });
        }

        #[cfg(feature = "bincode")]
        {
            let serializer = BincodeSerializer;
            let bytes = serializer.serialize(data).unwrap();
            group.throughput(Throughput::Bytes(bytes.len() as u64));
            group.bench_with_input(BenchmarkId::new("bincode", name), &bytes, |b, bytes| {
                b.iter(|| {
                    let result: Profile = serializer.deserialize(black_box(bytes)).unwrap();
                    black_box(result);
                });
            });
        }
    }

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    // The soft strategies wrap values in a freshness envelope; this measures
    // what that wrapper costs over serializing the bare value.
    let serializer = JsonSerializer;
    let value = Profile::large();
    let entry = SoftEntry::new(value.clone(), Duration::from_secs(60));

    let bare_bytes = serializer.serialize(&value).unwrap();
    let entry_bytes = serializer.serialize(&entry).unwrap();

    let mut group = c.benchmark_group("envelope");

    group.bench_function("bare_decode", |b| {
        b.iter(|| {
            let result: Profile = serializer.deserialize(black_box(&bare_bytes)).unwrap();
            black_box(result);
        });
    });

    group.bench_function("entry_decode", |b| {
        b.iter(|| {
            let result: SoftEntry<Profile> =
                serializer.deserialize(black_box(&entry_bytes)).unwrap();
            black_box(result);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_serialize, bench_deserialize, bench_envelope);
criterion_main!(benches);
