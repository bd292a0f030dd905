//! Benchmarks for lindb writes, flushes and distributed queries
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lindb::interval::{ONE_MINUTE, ONE_SECOND, now_millis};
use lindb::query::{AggFunc, DownSampling, PlanBuilder, Query, TaskHandler};
use lindb::rpc::LocalNetwork;
use lindb::tsdb::{EngineBuilder, FlushableShard};
use lindb::{DatabaseOption, EngineConfig, Field, FieldType, Interval, Row, Tag, TimeRange};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn rows(base: i64, hosts: usize, points: usize) -> Vec<Row> {
    let mut rows = Vec::with_capacity(hosts * points);
    for h in 0..hosts {
        for p in 0..points {
            rows.push(Row::with_tags(
                "cpu",
                vec![Tag::new("host", format!("host-{h}"))],
                base + (p as i64) * 10 * ONE_SECOND,
                vec![Field::new("usage", FieldType::Sum, p as f64)],
            ));
        }
    }
    rows
}

fn base_time() -> i64 {
    let t = now_millis() - 30 * ONE_MINUTE;
    t - t.rem_euclid(ONE_MINUTE)
}

/// Benchmark shard writes
fn bench_write_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_rows");

    for hosts in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(hosts), hosts, |b, &hosts| {
            let dir = TempDir::new().unwrap();
            let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
            let db = engine
                .create_database("bench", DatabaseOption::default())
                .unwrap();
            db.create_shards(&[1]).unwrap();
            let shard = db.get_shard(1).unwrap();
            let rows = rows(base_time(), hosts, 10);

            b.iter(|| {
                shard.write_rows(black_box(&rows)).unwrap();
            });
            engine.close().unwrap();
        });
    }

    group.finish();
}

/// Benchmark flushing a shard holding 100 series
fn bench_flush_shard(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
    let db = engine
        .create_database("bench", DatabaseOption::default())
        .unwrap();
    db.create_shards(&[1]).unwrap();
    let shard = db.get_shard(1).unwrap();
    let rows = rows(base_time(), 100, 6);

    c.bench_function("flush_100_series", |b| {
        b.iter(|| {
            shard.write_rows(&rows).unwrap();
            shard.flush().unwrap();
        });
    });
    engine.close().unwrap();
}

fn bench_down_sampling(c: &mut Criterion) {
    let storage = Interval::from_secs(10);
    let range = TimeRange::new(35 * ONE_SECOND, 65 * ONE_MINUTE);
    c.bench_function("down_sampling_calc", |b| {
        b.iter(|| {
            DownSampling::calc(black_box(Some(Interval::from_secs(60))), storage, range).unwrap()
        });
    });
}

/// Benchmark a root -> leaf query over the in-process network
fn bench_distributed_query(c: &mut Criterion) {
    let network = LocalNetwork::new();
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
    let db = engine
        .create_database("bench", DatabaseOption::default())
        .unwrap();
    db.create_shards(&[1]).unwrap();
    let base = base_time();
    db.get_shard(1)
        .unwrap()
        .write_rows(&rows(base, 100, 30))
        .unwrap();

    let leaf = TaskHandler::new(
        "leaf",
        Some(Arc::clone(&engine)),
        network.client_factory("leaf"),
        network.server_factory("leaf"),
    );
    network.register("leaf", Arc::new(leaf)).unwrap();
    let root = Arc::new(TaskHandler::new(
        "root",
        None,
        network.client_factory("root"),
        network.server_factory("root"),
    ));
    network.register("root", root.clone()).unwrap();

    let plan = PlanBuilder::new("bench", "root")
        .leaf("leaf", vec![1])
        .build(true)
        .unwrap();
    let query = Query::new("cpu", TimeRange::new(base, base + 5 * ONE_MINUTE))
        .field("usage", AggFunc::Avg)
        .group_by("host")
        .interval(Interval::from_secs(60));

    c.bench_function("query_100_series", |b| {
        b.iter(|| {
            let job = root.job_manager().submit_job(&plan, &query).unwrap();
            black_box(job.wait(Duration::from_secs(10)).unwrap());
        });
    });

    engine.close().unwrap();
    network.shutdown();
}

criterion_group!(
    benches,
    bench_write_rows,
    bench_flush_shard,
    bench_down_sampling,
    bench_distributed_query
);
criterion_main!(benches);
