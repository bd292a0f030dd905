use lindb::filter::FilterContext;
use lindb::interval::{ONE_MINUTE, ONE_SECOND, now_millis};
use lindb::tsdb::{EngineBuilder, FlushableShard};
use lindb::{DatabaseOption, EngineConfig, Field, FieldType, Row, Tag, TimeRange};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn base_time() -> i64 {
    let t = now_millis() - 20 * ONE_MINUTE;
    t - t.rem_euclid(ONE_MINUTE)
}

#[test]
fn test_concurrent_writes_with_flushes() {
    let temp_dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(
        EngineConfig::new(temp_dir.path()).with_flush_interval(Duration::from_millis(20)),
    )
    .build()
    .unwrap();
    let db = engine
        .create_database("db", DatabaseOption::default())
        .unwrap();
    db.create_shards(&[1]).unwrap();
    let shard = db.get_shard(1).unwrap();
    let base = base_time();

    let num_threads = 8;
    let writes_per_thread = 60;
    let mut handles = vec![];

    for thread_id in 0..num_threads {
        let shard = Arc::clone(&shard);
        handles.push(thread::spawn(move || {
            for i in 0..writes_per_thread {
                let row = Row::with_tags(
                    "contention",
                    vec![Tag::new("writer", thread_id.to_string())],
                    base + (i as i64) * ONE_SECOND * 10,
                    vec![Field::new("count", FieldType::Sum, 1.0)],
                );
                shard.write_rows(&[row]).unwrap();
            }
        }));
    }

    // flush concurrently with the writers
    let flusher = {
        let shard = Arc::clone(&shard);
        thread::spawn(move || {
            for _ in 0..10 {
                let _ = shard.flush();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    flusher.join().unwrap();
    shard.flush().unwrap();

    // every write landed exactly once, across file tables and memory
    let metric_id = db.index().get_metric_id("contention").unwrap();
    let series = db.index().find_series_ids(metric_id, |_| true);
    assert_eq!(series.len(), num_threads);
    let range = TimeRange::new(base, base + 10 * ONE_MINUTE);
    let ctx = FilterContext::new(metric_id, series.clone(), Vec::new(), range);
    let mut total = 0.0;
    for family in shard.get_data_families(&range).unwrap() {
        for rs in family.filter(&ctx).unwrap() {
            for data in rs.load(&series).unwrap() {
                total += data.block.fields["count"].slots.values().sum::<f64>();
            }
        }
    }
    assert_eq!(total, (num_threads * writes_per_thread) as f64);
    assert_eq!(
        shard.statistics().snapshot().write_rows,
        (num_threads * writes_per_thread) as u64
    );
    engine.close().unwrap();
}

#[test]
fn test_concurrent_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(temp_dir.path()))
        .build()
        .unwrap();

    let mut handles = vec![];
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let name = format!("db{}", i % 2);
            let db = engine
                .create_database(&name, DatabaseOption::default())
                .unwrap();
            db.create_shards(&[1, 2]).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.database_names(), vec!["db0", "db1"]);
    assert_eq!(engine.shard_manager().len(), 4);
    engine.close().unwrap();
}
