//! Per-task state on root and intermediate nodes.

use super::model::PartialResult;
use crate::rpc::TaskResponse;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Root,
    Intermediate,
}

/// Collects the responses of the children of one task.
pub struct TaskContext {
    task_id: String,
    task_type: TaskType,
    job_id: u64,
    parent_task_id: String,
    parent_node: String,
    expect_results: AtomicUsize,
    completed: AtomicBool,
    result: Mutex<PartialResult>,
    errors: Mutex<Vec<String>>,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        task_type: TaskType,
        job_id: u64,
        parent_task_id: impl Into<String>,
        parent_node: impl Into<String>,
        expect_results: usize,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            job_id,
            parent_task_id: parent_task_id.into(),
            parent_node: parent_node.into(),
            expect_results: AtomicUsize::new(expect_results),
            completed: AtomicBool::new(expect_results == 0),
            result: Mutex::new(PartialResult::default()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn parent_task_id(&self) -> &str {
        &self.parent_task_id
    }

    pub fn parent_node(&self) -> &str {
        &self.parent_node
    }

    pub fn pending_results(&self) -> usize {
        self.expect_results.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Merges one child response. Returns true exactly once: for the
    /// response that completes the last expected child.
    pub fn receive_result(&self, resp: &TaskResponse) -> bool {
        if resp.is_error() {
            self.errors
                .lock()
                .push(format!("{}: {}", resp.send_node, resp.err_msg));
        } else if !resp.payload.is_empty() {
            match PartialResult::decode(&resp.payload) {
                Ok(partial) => self.result.lock().merge(&partial),
                Err(e) => {
                    warn!(task = %self.task_id, error = %e, "Dropping undecodable task result");
                    self.errors.lock().push(e.to_string());
                }
            }
        }

        if !resp.completed {
            return false;
        }
        let prev = self
            .expect_results
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                self.completed.store(true, Ordering::Release);
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!(task = %self.task_id, "Unexpected response for completed task");
                false
            }
        }
    }

    /// Takes the merged result of all children.
    pub fn take_result(&self) -> PartialResult {
        std::mem::take(&mut *self.result.lock())
    }

    /// Child errors joined into one message, or `None` when all succeeded.
    pub fn error_message(&self) -> Option<String> {
        let errors = self.errors.lock();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }

    /// Builds the response this task sends to its parent.
    pub fn to_response(&self, send_node: &str) -> TaskResponse {
        let payload = match self.take_result().encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.errors.lock().push(e.to_string());
                Vec::new()
            }
        };
        TaskResponse {
            job_id: self.job_id,
            task_id: self.parent_task_id.clone(),
            completed: true,
            payload,
            err_msg: self.error_message().unwrap_or_default(),
            send_node: send_node.to_string(),
        }
    }
}
