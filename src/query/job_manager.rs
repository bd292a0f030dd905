//! Root side of a distributed query: one job per submitted query.

use super::context::{TaskContext, TaskType};
use super::model::{Query, ResultSet};
use super::plan::PhysicalPlan;
use super::task_manager::TaskManager;
use crate::rpc::TaskRequest;
use crate::{LinDbError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Handle on a running job; the submitter waits on it for the result.
pub struct JobContext {
    job_id: u64,
    query: Query,
    outcome: Mutex<Option<std::result::Result<ResultSet, String>>>,
    done: Condvar,
    /// Unregisters the job and its root task when the submitter gives up.
    abandon: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("metric", &self.query.metric)
            .field("done", &self.is_done())
            .finish()
    }
}

impl JobContext {
    fn new(job_id: u64, query: Query) -> Self {
        Self {
            job_id,
            query,
            outcome: Mutex::new(None),
            done: Condvar::new(),
            abandon: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_done(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn finish(&self, outcome: std::result::Result<ResultSet, String>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }

    /// Blocks until the job finished or `timeout` elapsed. A job that timed
    /// out is no longer tracked, so results arriving later are dropped.
    pub fn wait(&self, timeout: Duration) -> Result<ResultSet> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        match slot.as_ref() {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(msg)) => Err(LinDbError::Query(msg.clone())),
            None => {
                drop(slot);
                if let Some(abandon) = self.abandon.lock().take() {
                    debug!(job = self.job_id, "Job timed out, dropping it");
                    abandon();
                }
                Err(LinDbError::ChannelTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

pub struct JobManager {
    seq: AtomicU64,
    jobs: Arc<DashMap<u64, Arc<JobContext>>>,
    task_manager: Arc<TaskManager>,
}

impl JobManager {
    pub fn new(task_manager: Arc<TaskManager>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            jobs: Arc::new(DashMap::new()),
            task_manager,
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Sends the query to the root's children of `plan`.
    pub fn submit_job(&self, plan: &PhysicalPlan, query: &Query) -> Result<Arc<JobContext>> {
        query.validate()?;
        plan.validate()?;
        let job_id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let targets = plan.root_targets();
        let task_id = self.task_manager.alloc_task_id();
        let ctx = Arc::new(TaskContext::new(
            &task_id,
            TaskType::Root,
            job_id,
            "",
            "",
            targets.len(),
        ));
        let req = TaskRequest {
            job_id,
            parent_task_id: task_id.clone(),
            physical_plan: plan.encode()?,
            payload: query.encode()?,
        };

        let job = Arc::new(JobContext::new(job_id, query.clone()));
        let jobs: Weak<DashMap<u64, Arc<JobContext>>> = Arc::downgrade(&self.jobs);
        let task_manager = Arc::clone(&self.task_manager);
        *job.abandon.lock() = Some(Box::new(move || {
            if let Some(jobs) = jobs.upgrade() {
                jobs.remove(&job_id);
            }
            task_manager.complete(&task_id);
        }));
        self.jobs.insert(job_id, Arc::clone(&job));
        if let Err(e) = self.task_manager.submit(ctx, &targets, &req) {
            self.jobs.remove(&job_id);
            return Err(e);
        }
        info!(job = job_id, database = %plan.database, metric = %query.metric, targets = targets.len(), "Job submitted");
        Ok(job)
    }

    /// Finishes the job of a completed root task.
    pub fn complete_job(&self, ctx: &TaskContext) {
        let Some((_, job)) = self.jobs.remove(&ctx.job_id()) else {
            debug!(job = ctx.job_id(), "Completion for unknown job");
            return;
        };
        let outcome = match ctx.error_message() {
            Some(msg) => Err(msg),
            None => ResultSet::from_partial(&job.query, &ctx.take_result()).map_err(|e| e.to_string()),
        };
        debug!(job = job.job_id, ok = outcome.is_ok(), "Job finished");
        job.finish(outcome);
    }

    /// Drops a job nobody waits for any more.
    pub fn cancel(&self, job_id: u64) {
        if let Some((_, job)) = self.jobs.remove(&job_id) {
            job.finish(Err("job cancelled".to_string()));
        }
    }

    pub fn num_of_jobs(&self) -> usize {
        self.jobs.len()
    }
}
