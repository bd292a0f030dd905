//! Handles responses coming up the task tree.

use super::context::TaskType;
use super::job_manager::JobManager;
use super::task_manager::TaskManager;
use crate::rpc::TaskResponse;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TaskReceiver {
    task_manager: Arc<TaskManager>,
    job_manager: Option<Arc<JobManager>>,
}

impl TaskReceiver {
    /// `job_manager` is only set on nodes that act as root.
    pub fn new(task_manager: Arc<TaskManager>, job_manager: Option<Arc<JobManager>>) -> Self {
        Self {
            task_manager,
            job_manager,
        }
    }

    pub fn receive(&self, resp: &TaskResponse) {
        let Some(ctx) = self.task_manager.get(&resp.task_id) else {
            debug!(task = %resp.task_id, from = %resp.send_node, "Response for unknown task");
            return;
        };
        if !ctx.receive_result(resp) {
            return;
        }
        self.task_manager.complete(ctx.task_id());

        match ctx.task_type() {
            TaskType::Intermediate => {
                let up = ctx.to_response(self.task_manager.node());
                if let Err(e) = self.task_manager.send_response(ctx.parent_node(), up) {
                    warn!(task = %ctx.task_id(), parent = %ctx.parent_node(), error = %e, "Failed to send merged result");
                }
            }
            TaskType::Root => match &self.job_manager {
                Some(jobs) => jobs.complete_job(&ctx),
                None => warn!(task = %ctx.task_id(), "Root task completed on a node without jobs"),
            },
        }
    }
}
