//! Entry point of a query node: routes incoming requests to the role the
//! node plays in the plan and responses to the receiver.

use super::intermediate::IntermediateTaskProcessor;
use super::job_manager::JobManager;
use super::leaf::LeafTaskProcessor;
use super::plan::PhysicalPlan;
use super::receiver::TaskReceiver;
use super::task_manager::TaskManager;
use crate::metrics::QueryStatistics;
use crate::rpc::{
    TaskClientFactory, TaskRequest, TaskResponse, TaskServerFactory, TaskService,
};
use crate::tsdb::Engine;
use crate::{LinDbError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TaskHandler {
    task_manager: Arc<TaskManager>,
    job_manager: Arc<JobManager>,
    intermediate: IntermediateTaskProcessor,
    leaf: Option<LeafTaskProcessor>,
    receiver: TaskReceiver,
}

impl TaskHandler {
    /// A node without an engine can act as root and intermediate only.
    pub fn new(
        node: impl Into<String>,
        engine: Option<Arc<Engine>>,
        client_factory: Arc<dyn TaskClientFactory>,
        server_factory: Arc<dyn TaskServerFactory>,
    ) -> Self {
        let node = node.into();
        let stats = engine
            .as_ref()
            .map(|e| Arc::clone(e.query_statistics()))
            .unwrap_or_else(|| Arc::new(QueryStatistics::default()));
        let task_manager = Arc::new(TaskManager::new(
            node.clone(),
            client_factory,
            Arc::clone(&server_factory),
            stats,
        ));
        let job_manager = Arc::new(JobManager::new(Arc::clone(&task_manager)));
        Self {
            intermediate: IntermediateTaskProcessor::new(Arc::clone(&task_manager)),
            leaf: engine.map(|e| LeafTaskProcessor::new(node, e, server_factory)),
            receiver: TaskReceiver::new(Arc::clone(&task_manager), Some(Arc::clone(&job_manager))),
            task_manager,
            job_manager,
        }
    }

    pub fn node(&self) -> &str {
        self.task_manager.node()
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.job_manager
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    fn process(&self, req: &TaskRequest) -> Result<()> {
        let plan = PhysicalPlan::decode(&req.physical_plan)?;
        if plan.intermediate(self.node()).is_some() {
            return self.intermediate.process(&plan, req);
        }
        match &self.leaf {
            Some(leaf) => leaf.process(req),
            None => Err(LinDbError::WrongRequest {
                node: self.node().to_string(),
            }),
        }
    }
}

impl TaskService for TaskHandler {
    fn handle_request(&self, from: &str, req: TaskRequest) {
        debug!(node = %self.node(), from = %from, job = req.job_id, "Task request received");
        let Err(e) = self.process(&req) else {
            return;
        };
        warn!(node = %self.node(), from = %from, job = req.job_id, error = %e, "Task request failed");
        let resp = TaskResponse {
            job_id: req.job_id,
            task_id: req.parent_task_id,
            completed: true,
            payload: Vec::new(),
            err_msg: e.to_string(),
            send_node: self.node().to_string(),
        };
        if let Err(e) = self.task_manager.send_response(from, resp) {
            warn!(node = %self.node(), to = %from, error = %e, "Failed to report task error");
        }
    }

    fn handle_response(&self, from: &str, resp: TaskResponse) {
        debug!(node = %self.node(), from = %from, task = %resp.task_id, "Task response received");
        self.receiver.receive(&resp);
    }
}
