//! Query bus throughput benchmarks
//!
//! Measures round-trip overhead of the bus itself against the in-memory
//! provider, so no database time is included:
//! - Single read and mutation round trips
//! - Concurrent mutations on the shared pool
//! - Sharded mutations spread over the lanes
//!
//! Run with: `cargo bench -p querybus-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::future::join_all;
use querybus_runtime::{BusConfig, QueryBus};
use querybus_testing::{InMemoryConnectionProvider, insert_into};
use std::time::Duration;

const INSERT: &str = "INSERT INTO cart (user_id, product_id) VALUES (?, ?)";
const SELECT: &str = "SELECT 1";
const BUDGET: Duration = Duration::from_secs(5);

fn provider() -> InMemoryConnectionProvider {
    let provider = InMemoryConnectionProvider::new();
    provider.on_execute(INSERT, insert_into("cart"));
    provider.on_query(SELECT, |_, _| Ok(vec![vec![1_i64.into()]]));
    provider
}

fn start(runtime: &tokio::runtime::Runtime, pool_size: usize) -> QueryBus<InMemoryConnectionProvider> {
    let _guard = runtime.enter();
    QueryBus::start(provider(), BusConfig::default().with_pool_size(pool_size))
        .expect("bus should start")
}

fn bench_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let bus = start(&runtime, 4);

    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("read", |b| {
        b.to_async(&runtime).iter(|| async {
            let rows = bus
                .submit_read(SELECT, BUDGET)
                .await
                .expect("read should succeed")
                .collect_rows()
                .await
                .expect("rows should decode");
            black_box(rows);
        });
    });

    group.bench_function("mutation", |b| {
        b.to_async(&runtime).iter(|| async {
            let summary = bus
                .submit_mutation(INSERT, vec!["user-1".into(), 55_i64.into()], BUDGET)
                .await
                .expect("mutation should succeed");
            black_box(summary);
        });
    });

    group.finish();
}

fn bench_concurrent_mutations(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let mut group = c.benchmark_group("concurrent_mutations");

    for pool_size in [1_usize, 4, 16] {
        let bus = start(&runtime, pool_size);
        group.throughput(Throughput::Elements(100));

        group.bench_with_input(BenchmarkId::new("shared_pool", pool_size), &bus, |b, bus| {
            b.to_async(&runtime).iter(|| async {
                let results = join_all((0..100_i64).map(|i| {
                    bus.submit_mutation(INSERT, vec!["user-1".into(), i.into()], BUDGET)
                }))
                .await;
                black_box(results);
            });
        });

        group.bench_with_input(BenchmarkId::new("sharded", pool_size), &bus, |b, bus| {
            b.to_async(&runtime).iter(|| async {
                let results = join_all((0..100_i64).map(|i| {
                    let key = format!("user-{}", i % 10);
                    async move {
                        bus.submit_sharded_mutation(&key, INSERT, vec![key.clone().into(), i.into()], BUDGET)
                            .await
                    }
                }))
                .await;
                black_box(results);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_concurrent_mutations);
criterion_main!(benches);
