//! Flush scheduling driven by memory pressure and by family state.

use lindb::interval::{ONE_MINUTE, ONE_SECOND, now_millis};
use lindb::tsdb::{EngineBuilder, FlushableShard};
use lindb::{DatabaseOption, Engine, EngineConfig, Field, FieldType, Row, Tag};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Memory usage ratio settable from the test, in percent.
fn sampler() -> (Arc<AtomicU64>, lindb::tsdb::MemoryUsageSampler) {
    let used = Arc::new(AtomicU64::new(10));
    let u = Arc::clone(&used);
    (used, Arc::new(move || u.load(Ordering::SeqCst) as f64 / 100.0))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn write(engine: &Engine, db: &str, series: usize) {
    let base = now_millis() - ONE_MINUTE;
    let rows: Vec<Row> = (0..series)
        .map(|i| {
            Row::with_tags(
                "cpu",
                vec![Tag::new("host", format!("h{i}"))],
                base + (i as i64 % 6) * 10 * ONE_SECOND,
                vec![Field::new("usage", FieldType::Sum, 1.0)],
            )
        })
        .collect();
    engine
        .get_database(db)
        .unwrap()
        .get_shard(1)
        .unwrap()
        .write_rows(&rows)
        .unwrap();
}

fn mem_size(engine: &Engine, db: &str) -> usize {
    engine
        .get_database(db)
        .unwrap()
        .get_shard(1)
        .unwrap()
        .mem_size()
}

#[test]
fn test_high_watermark_flushes_largest_shard_first() {
    let dir = TempDir::new().unwrap();
    let (used, sampler) = sampler();
    let engine = EngineBuilder::new(
        EngineConfig::new(dir.path()).with_flush_interval(Duration::from_millis(30)),
    )
    .with_memory_sampler(sampler)
    .build()
    .unwrap();
    for name in ["big", "small"] {
        engine
            .create_database(name, DatabaseOption::default())
            .unwrap()
            .create_shards(&[1])
            .unwrap();
    }
    write(&engine, "big", 200);
    write(&engine, "small", 2);
    assert!(mem_size(&engine, "big") > mem_size(&engine, "small"));

    // below the watermark nothing is flushed
    thread::sleep(Duration::from_millis(150));
    assert!(mem_size(&engine, "big") > 0);
    assert_eq!(engine.flush_checker().statistics().snapshot().watermark_flushes, 0);

    used.store(90, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || mem_size(&engine, "big") == 0));
    // one watermark flush at a time: the small shard may follow only later
    let stats = engine.flush_checker().statistics().snapshot();
    assert!(stats.watermark_flushes >= 1);

    assert!(wait_until(Duration::from_secs(5), || mem_size(&engine, "small") == 0));
    used.store(10, Ordering::SeqCst);
    engine.close().unwrap();
}

#[test]
fn test_checker_stops_with_engine() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(
        EngineConfig::new(dir.path()).with_flush_interval(Duration::from_millis(20)),
    )
    .build()
    .unwrap();
    assert!(engine.flush_checker().is_running());
    assert!(wait_until(Duration::from_secs(2), || {
        engine.flush_checker().statistics().snapshot().checks >= 2
    }));
    engine.close().unwrap();
    assert!(!engine.flush_checker().is_running());
    // closing twice is fine
    engine.close().unwrap();
}

#[test]
fn test_explicit_flush_of_registered_shard() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
    engine
        .create_database("db", DatabaseOption::default())
        .unwrap()
        .create_shards(&[1])
        .unwrap();
    write(&engine, "db", 10);

    let shard = engine.shard_manager().get("db/1").unwrap();
    assert!(!shard.need_flush());
    assert!(shard.mem_size() > 0);
    assert!(engine.flush_checker().flush_shard(Arc::clone(&shard), false));
    assert_eq!(shard.mem_size(), 0);
    assert_eq!(engine.flush_checker().in_flight(), 0);
    engine.close().unwrap();
}
