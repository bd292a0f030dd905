//! Internal counters for the write, flush and query paths.
//!
//! Counters are plain atomics; `snapshot()` copies them out and `log()` emits
//! them as one structured tracing event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of one data family.
#[derive(Debug, Default)]
pub struct FamilyStatistics {
    pub write_rows: AtomicU64,
    pub write_row_failures: AtomicU64,
    pub memdb_create_failures: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub flush_duration_ms: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_failures: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FamilyStatisticsSnapshot {
    pub write_rows: u64,
    pub write_row_failures: u64,
    pub memdb_create_failures: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub flush_duration_ms: u64,
    pub compactions: u64,
    pub compaction_failures: u64,
    pub evictions: u64,
}

impl FamilyStatistics {
    pub fn record_flush(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.flush_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FamilyStatisticsSnapshot {
        FamilyStatisticsSnapshot {
            write_rows: self.write_rows.load(Ordering::Relaxed),
            write_row_failures: self.write_row_failures.load(Ordering::Relaxed),
            memdb_create_failures: self.memdb_create_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            flush_duration_ms: self.flush_duration_ms.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self, indicator: &str) {
        let s = self.snapshot();
        tracing::info!(
            family = indicator,
            write_rows = s.write_rows,
            write_row_failures = s.write_row_failures,
            memdb_create_failures = s.memdb_create_failures,
            flushes = s.flushes,
            flush_failures = s.flush_failures,
            flush_duration_ms = s.flush_duration_ms,
            compactions = s.compactions,
            "family statistics"
        );
    }
}

/// Counters of the flush checker.
#[derive(Debug, Default)]
pub struct FlushCheckerStatistics {
    pub checks: AtomicU64,
    pub flush_requests: AtomicU64,
    pub watermark_flushes: AtomicU64,
    pub skipped_in_flight: AtomicU64,
    pub flush_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushCheckerStatisticsSnapshot {
    pub checks: u64,
    pub flush_requests: u64,
    pub watermark_flushes: u64,
    pub skipped_in_flight: u64,
    pub flush_failures: u64,
}

impl FlushCheckerStatistics {
    pub fn snapshot(&self) -> FlushCheckerStatisticsSnapshot {
        FlushCheckerStatisticsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            flush_requests: self.flush_requests.load(Ordering::Relaxed),
            watermark_flushes: self.watermark_flushes.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        tracing::info!(
            checks = s.checks,
            flush_requests = s.flush_requests,
            watermark_flushes = s.watermark_flushes,
            skipped_in_flight = s.skipped_in_flight,
            flush_failures = s.flush_failures,
            "flush checker statistics"
        );
    }
}

/// Counters of one shard's write path.
#[derive(Debug, Default)]
pub struct ShardStatistics {
    pub write_rows: AtomicU64,
    pub out_of_window_rows: AtomicU64,
    pub invalid_rows: AtomicU64,
    pub duplicate_sequences: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardStatisticsSnapshot {
    pub write_rows: u64,
    pub out_of_window_rows: u64,
    pub invalid_rows: u64,
    pub duplicate_sequences: u64,
    pub flushes: u64,
    pub flush_failures: u64,
}

impl ShardStatistics {
    pub fn snapshot(&self) -> ShardStatisticsSnapshot {
        ShardStatisticsSnapshot {
            write_rows: self.write_rows.load(Ordering::Relaxed),
            out_of_window_rows: self.out_of_window_rows.load(Ordering::Relaxed),
            invalid_rows: self.invalid_rows.load(Ordering::Relaxed),
            duplicate_sequences: self.duplicate_sequences.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counters of the per-node query execution.
#[derive(Debug, Default)]
pub struct QueryStatistics {
    pub flows: AtomicU64,
    pub flow_failures: AtomicU64,
    pub panicked_tasks: AtomicU64,
    pub tasks_sent: AtomicU64,
    pub task_send_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryStatisticsSnapshot {
    pub flows: u64,
    pub flow_failures: u64,
    pub panicked_tasks: u64,
    pub tasks_sent: u64,
    pub task_send_failures: u64,
}

impl QueryStatistics {
    pub fn snapshot(&self) -> QueryStatisticsSnapshot {
        QueryStatisticsSnapshot {
            flows: self.flows.load(Ordering::Relaxed),
            flow_failures: self.flow_failures.load(Ordering::Relaxed),
            panicked_tasks: self.panicked_tasks.load(Ordering::Relaxed),
            tasks_sent: self.tasks_sent.load(Ordering::Relaxed),
            task_send_failures: self.task_send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_records_success_and_failure() {
        let stats = FamilyStatistics::default();
        stats.record_flush(Duration::from_millis(5), true);
        stats.record_flush(Duration::from_millis(7), false);
        let s = stats.snapshot();
        assert_eq!(s.flushes, 1);
        assert_eq!(s.flush_failures, 1);
        assert_eq!(s.flush_duration_ms, 12);
    }
}
