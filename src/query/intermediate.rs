//! Intermediate node: fans a request out to its leaves and merges their
//! results before answering its own parent.

use super::context::{TaskContext, TaskType};
use super::plan::PhysicalPlan;
use super::task_manager::TaskManager;
use crate::rpc::TaskRequest;
use crate::{LinDbError, Result};
use std::sync::Arc;
use tracing::debug;

pub struct IntermediateTaskProcessor {
    task_manager: Arc<TaskManager>,
}

impl IntermediateTaskProcessor {
    pub fn new(task_manager: Arc<TaskManager>) -> Self {
        Self { task_manager }
    }

    pub fn process(&self, plan: &PhysicalPlan, req: &TaskRequest) -> Result<()> {
        let node = self.task_manager.node();
        let intermediate = plan
            .intermediate(node)
            .ok_or_else(|| LinDbError::WrongRequest {
                node: node.to_string(),
            })?;
        let targets: Vec<String> = plan.leafs_of(node).map(|l| l.indicator.clone()).collect();

        let task_id = self.task_manager.alloc_task_id();
        let ctx = Arc::new(TaskContext::new(
            &task_id,
            TaskType::Intermediate,
            req.job_id,
            &req.parent_task_id,
            &intermediate.parent,
            targets.len(),
        ));
        if targets.is_empty() {
            debug!(job = req.job_id, node = %node, "Intermediate without leaves");
            return self
                .task_manager
                .send_response(&intermediate.parent, ctx.to_response(node));
        }

        let forward = TaskRequest {
            job_id: req.job_id,
            parent_task_id: task_id,
            physical_plan: req.physical_plan.clone(),
            payload: req.payload.clone(),
        };
        self.task_manager.submit(ctx, &targets, &forward)
    }
}
