//! Background scheduler deciding when and which shard flushes.
//!
//! A ticker thread walks all shards and queues those that need a flush. When
//! no flush is running and memory usage exceeds the high watermark, the
//! largest shard is queued as a watermark flush. Requests are handed through
//! a zero-capacity channel to a fixed set of flush workers, so the ticker
//! blocks while every worker is busy.

use super::manager::{FlushableShard, ShardManager};
use crate::config::EngineConfig;
use crate::metrics::FlushCheckerStatistics;
use crate::{LinDbError, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Returns the used ratio of available memory, in `[0, 1]`.
pub type MemoryUsageSampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// The sampler reading cgroup or system memory usage.
pub fn system_memory_sampler() -> MemoryUsageSampler {
    Arc::new(crate::cgroup::memory_used_ratio)
}

/// A flush job handed to the workers.
pub struct FlushRequest {
    pub shard: Arc<dyn FlushableShard>,
    /// Set for flushes triggered by the memory watermark.
    pub global: bool,
}

struct CheckerInner {
    shard_manager: Arc<ShardManager>,
    check_interval: Duration,
    concurrency: usize,
    high_watermark: f64,
    sampler: MemoryUsageSampler,
    flushing: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    watermark_flushing: AtomicBool,
    stats: FlushCheckerStatistics,
}

struct Running {
    shutdown: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Periodic flush scheduler with bounded flush concurrency.
pub struct DataFlushChecker {
    inner: Arc<CheckerInner>,
    running: Mutex<Option<Running>>,
}

impl DataFlushChecker {
    pub fn new(
        config: &EngineConfig,
        shard_manager: Arc<ShardManager>,
        sampler: MemoryUsageSampler,
    ) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                shard_manager,
                check_interval: config.flush_interval,
                concurrency: config.flush_concurrency.max(1),
                high_watermark: config.max_mem_usage_before_flush,
                sampler,
                flushing: Mutex::new(HashSet::new()),
                in_flight: AtomicUsize::new(0),
                watermark_flushing: AtomicBool::new(false),
                stats: FlushCheckerStatistics::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the ticker and flush workers. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (request_tx, request_rx) = bounded::<FlushRequest>(0);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut handles = Vec::with_capacity(self.inner.concurrency + 1);

        for id in 0..self.inner.concurrency {
            let inner = Arc::clone(&self.inner);
            let requests = request_rx.clone();
            let shutdown = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("flush-worker-{id}"))
                .spawn(move || inner.run_worker(id, requests, shutdown))?;
            handles.push(handle);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("flush-checker".to_string())
            .spawn(move || inner.run_ticker(request_tx, shutdown_rx))?;
        handles.push(handle);

        info!(
            interval_ms = self.inner.check_interval.as_millis() as u64,
            workers = self.inner.concurrency,
            "Started data flush checker"
        );
        *running = Some(Running {
            shutdown: shutdown_tx,
            handles,
        });
        Ok(())
    }

    /// Signals cancellation and waits for the ticker and workers to exit.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        drop(running.shutdown);
        for handle in running.handles {
            if handle.join().is_err() {
                error!("Flush checker thread panicked");
            }
        }
        self.inner.stats.log();
        info!("Stopped data flush checker");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Runs one flush of a shard on the calling thread, unless the shard is
    /// already being flushed. Returns whether the flush ran.
    pub fn flush_shard(&self, shard: Arc<dyn FlushableShard>, global: bool) -> bool {
        self.inner.do_flush(FlushRequest { shard, global })
    }

    /// Number of flushes currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> &FlushCheckerStatistics {
        &self.inner.stats
    }
}

impl Drop for DataFlushChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CheckerInner {
    fn run_worker(&self, id: usize, requests: Receiver<FlushRequest>, shutdown: Receiver<()>) {
        debug!(worker = id, "Flush worker started");
        loop {
            select! {
                recv(requests) -> msg => match msg {
                    Ok(request) => {
                        self.do_flush(request);
                    }
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!(worker = id, "Flush worker stopped");
    }

    fn run_ticker(&self, requests: Sender<FlushRequest>, shutdown: Receiver<()>) {
        let ticker = tick(self.check_interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    if !self.check(&requests, &shutdown) {
                        break;
                    }
                }
                recv(shutdown) -> _ => break,
            }
        }
    }

    /// One tick. Returns false once cancellation was observed.
    fn check(&self, requests: &Sender<FlushRequest>, shutdown: &Receiver<()>) -> bool {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let mut pending = Vec::new();
        self.shard_manager.walk(|shard| {
            if shard.need_flush() {
                pending.push(Arc::clone(shard));
            }
        });
        for shard in pending {
            if !self.request_flush_job(FlushRequest { shard, global: false }, requests, shutdown) {
                return false;
            }
        }

        if self.in_flight.load(Ordering::Acquire) > 0 {
            return true;
        }
        let used = (self.sampler)();
        if used <= self.high_watermark || self.watermark_flushing.load(Ordering::Acquire) {
            return true;
        }
        let Some(shard) = self.pick_largest_shard() else {
            return true;
        };

        warn!(
            used_ratio = used,
            high_watermark = self.high_watermark,
            shard = %shard.indicator(),
            mem_size = shard.mem_size(),
            "Memory usage above high watermark, flushing largest shard"
        );
        self.watermark_flushing.store(true, Ordering::Release);
        self.stats.watermark_flushes.fetch_add(1, Ordering::Relaxed);
        if !self.request_flush_job(FlushRequest { shard, global: true }, requests, shutdown) {
            self.watermark_flushing.store(false, Ordering::Release);
            return false;
        }
        true
    }

    fn pick_largest_shard(&self) -> Option<Arc<dyn FlushableShard>> {
        let mut largest: Option<(usize, Arc<dyn FlushableShard>)> = None;
        self.shard_manager.walk(|shard| {
            if shard.is_flushing() {
                return;
            }
            let size = shard.mem_size();
            if size > 0 && largest.as_ref().is_none_or(|(max, _)| size > *max) {
                largest = Some((size, Arc::clone(shard)));
            }
        });
        largest.map(|(_, shard)| shard)
    }

    /// Hands a request to a worker, blocking until one is free. Returns false
    /// when cancelled first.
    fn request_flush_job(
        &self,
        request: FlushRequest,
        requests: &Sender<FlushRequest>,
        shutdown: &Receiver<()>,
    ) -> bool {
        self.stats.flush_requests.fetch_add(1, Ordering::Relaxed);
        select! {
            send(requests, request) -> res => res.is_ok(),
            recv(shutdown) -> _ => false,
        }
    }

    fn do_flush(&self, request: FlushRequest) -> bool {
        let indicator = request.shard.indicator().to_string();
        if !self.flushing.lock().insert(indicator.clone()) {
            self.stats.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
            debug!(shard = %indicator, "Shard already flushing, skipped");
            if request.global {
                self.watermark_flushing.store(false, Ordering::Release);
            }
            return false;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let start = Instant::now();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| request.shard.flush()))
            .unwrap_or_else(|_| Err(LinDbError::Other(format!("flush of shard {indicator} panicked"))));
        match result {
            Ok(()) => debug!(
                shard = %indicator,
                global = request.global,
                duration_ms = start.elapsed().as_millis() as u64,
                "Flush job done"
            ),
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(shard = %indicator, global = request.global, error = %e, "Flush job failed");
            }
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.flushing.lock().remove(&indicator);
        if request.global {
            self.watermark_flushing.store(false, Ordering::Release);
        }
        true
    }
}
