//! Request-scoped execution of a query on one storage node.
//!
//! Work is submitted stage by stage to the engine's query pools. The flow
//! tracks every submitted task in one pending map; when the last task of the
//! last stage finishes, the reduced result is handed to the completion
//! callback exactly once. A failure (including a panicking task) marks the
//! flow completed: already queued tasks turn into no-ops and the error is
//! what the callback receives.

use super::aggregation::FieldAggregator;
use super::downsampling::DownSampling;
use super::model::{PartialResult, Query};
use super::stage::{QueryPools, Stage};
use crate::metrics::QueryStatistics;
use crate::{LinDbError, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Receives the outcome of a flow.
pub type FlowCallback = Box<dyn FnOnce(Result<PartialResult>) + Send + 'static>;

#[derive(Default)]
struct FlowState {
    seq: u64,
    pending: HashMap<u64, Stage>,
    completed: bool,
    finished: bool,
    err: Option<LinDbError>,
    aggregator: PartialResult,
}

pub struct StorageQueryFlow {
    id: String,
    query: Query,
    down_sampling: DownSampling,
    pools: Arc<QueryPools>,
    stats: Arc<QueryStatistics>,
    state: Mutex<FlowState>,
    callback: Mutex<Option<FlowCallback>>,
    agg_free: Sender<FieldAggregator>,
    agg_pool: Receiver<FieldAggregator>,
    me: Weak<StorageQueryFlow>,
}

impl StorageQueryFlow {
    pub fn new(
        id: impl Into<String>,
        query: Query,
        down_sampling: DownSampling,
        pools: Arc<QueryPools>,
        stats: Arc<QueryStatistics>,
        aggregator_pool_size: usize,
        callback: FlowCallback,
    ) -> Arc<Self> {
        let (agg_free, agg_pool) = bounded(aggregator_pool_size.max(1));
        stats.flows.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|me| Self {
            id: id.into(),
            query,
            down_sampling,
            pools,
            stats,
            state: Mutex::new(FlowState::default()),
            callback: Mutex::new(Some(callback)),
            agg_free,
            agg_pool,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn down_sampling(&self) -> &DownSampling {
        &self.down_sampling
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn register(&self, stage: Stage) -> Option<u64> {
        let mut state = self.state.lock();
        if state.completed {
            return None;
        }
        state.seq += 1;
        let seq = state.seq;
        state.pending.insert(seq, stage);
        Some(seq)
    }

    /// Runs the initial dispatch on the calling thread. While it runs the
    /// flow cannot finish, even if every task it submits is already done.
    pub fn dispatch(&self, f: impl FnOnce()) {
        let Some(seq) = self.register(Stage::Filtering) else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            self.stats.panicked_tasks.fetch_add(1, Ordering::Relaxed);
            self.complete(Some(LinDbError::TaskPanicked(format!(
                "flow {} dispatch panicked",
                self.id
            ))));
        }
        self.task_done(seq);
    }

    pub fn filtering(&self, task: impl FnOnce() + Send + 'static) {
        self.execute(Stage::Filtering, task);
    }

    pub fn grouping(&self, task: impl FnOnce() + Send + 'static) {
        self.execute(Stage::Grouping, task);
    }

    pub fn scanner(&self, task: impl FnOnce() + Send + 'static) {
        self.execute(Stage::Scanner, task);
    }

    /// Submits a task to the pool of `stage`. Nothing is submitted once the
    /// flow completed.
    pub fn execute(&self, stage: Stage, task: impl FnOnce() + Send + 'static) {
        let Some(flow) = self.me.upgrade() else {
            return;
        };
        let Some(seq) = self.register(stage) else {
            return;
        };

        let wrapped = move || {
            if !flow.is_completed() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    let msg = panic_message(&*panic);
                    flow.stats.panicked_tasks.fetch_add(1, Ordering::Relaxed);
                    error!(flow = %flow.id, stage = %stage, panic = %msg, "Query task panicked");
                    flow.complete(Some(LinDbError::TaskPanicked(format!("{stage}: {msg}"))));
                }
            }
            flow.task_done(seq);
        };

        if let Err(e) = self.pools.pool(stage).execute(wrapped) {
            warn!(flow = %self.id, stage = %stage, error = %e, "Failed to submit query task");
            self.complete(Some(e));
            self.task_done(seq);
        }
    }

    /// Marks the flow completed. With an error the flow reports it instead of
    /// its data; the first error wins.
    pub fn complete(&self, err: Option<LinDbError>) {
        let mut state = self.state.lock();
        if let Some(e) = err {
            if state.err.is_none() {
                debug!(flow = %self.id, error = %e, "Query flow failed");
                state.err = Some(e);
            }
        }
        state.completed = true;
    }

    fn task_done(&self, seq: u64) {
        let outcome = {
            let mut state = self.state.lock();
            state.pending.remove(&seq);
            if !state.pending.is_empty() || state.finished {
                return;
            }
            state.finished = true;
            state.completed = true;
            match state.err.take() {
                Some(e) => Err(e),
                None => Ok(std::mem::take(&mut state.aggregator)),
            }
        };

        if outcome.is_err() {
            self.stats.flow_failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(outcome);
        }
    }

    /// Number of tasks not yet finished, the dispatch included.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Merges the points of one field of one group into the flow result.
    /// Reduction is serialized by the flow lock.
    pub fn reduce(&self, group: &str, field: &str, aggregator: &FieldAggregator) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.aggregator.merge_points(group, field, aggregator.points());
    }

    /// Takes an aggregator from the free list, or a new one when it is empty.
    pub fn get_aggregator(&self) -> FieldAggregator {
        self.agg_pool.try_recv().unwrap_or_default()
    }

    /// Returns an aggregator to the free list; dropped when the list is full.
    pub fn release_aggregator(&self, mut aggregator: FieldAggregator) {
        aggregator.reset();
        let _ = self.agg_free.try_send(aggregator);
    }

    pub fn pooled_aggregators(&self) -> usize {
        self.agg_pool.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
