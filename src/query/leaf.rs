//! Leaf node: runs the query against the local shards of the plan.

use super::downsampling::DownSampling;
use super::executor::StorageExecutor;
use super::flow::{FlowCallback, StorageQueryFlow};
use super::model::{PartialResult, Query};
use super::plan::PhysicalPlan;
use crate::rpc::{TaskRequest, TaskResponse, TaskServerFactory};
use crate::tsdb::Engine;
use crate::{LinDbError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct LeafTaskProcessor {
    node: String,
    engine: Arc<Engine>,
    server_factory: Arc<dyn TaskServerFactory>,
}

impl LeafTaskProcessor {
    pub fn new(
        node: impl Into<String>,
        engine: Arc<Engine>,
        server_factory: Arc<dyn TaskServerFactory>,
    ) -> Self {
        Self {
            node: node.into(),
            engine,
            server_factory,
        }
    }

    /// Starts the storage query of this node. On success the result is sent
    /// to the leaf's parent asynchronously; errors before that are returned.
    pub fn process(&self, req: &TaskRequest) -> Result<()> {
        let plan = PhysicalPlan::decode(&req.physical_plan)?;
        let leaf = plan.leaf(&self.node).ok_or_else(|| LinDbError::WrongRequest {
            node: self.node.clone(),
        })?;
        let stream = self
            .server_factory
            .get_stream(&leaf.parent)
            .ok_or_else(|| LinDbError::NoSendStream(leaf.parent.clone()))?;
        let database = self
            .engine
            .get_database(&plan.database)
            .ok_or_else(|| LinDbError::NoDatabase(plan.database.clone()))?;

        let query = Query::decode(&req.payload)?;
        query.validate()?;
        let down_sampling = DownSampling::calc(
            query.interval,
            database.option().write_interval(),
            query.time_range,
        )?;

        let job_id = req.job_id;
        let task_id = req.parent_task_id.clone();
        let node = self.node.clone();
        let parent = leaf.parent.clone();
        let callback: FlowCallback = Box::new(move |result: Result<PartialResult>| {
            let mut resp = TaskResponse {
                job_id,
                task_id,
                completed: true,
                send_node: node.clone(),
                ..Default::default()
            };
            match result.and_then(|partial| partial.encode()) {
                Ok(payload) => resp.payload = payload,
                Err(e) => resp.err_msg = e.to_string(),
            }
            debug!(job = job_id, node = %node, error = %resp.err_msg, "Leaf task finished");
            if let Err(e) = stream.send(resp) {
                warn!(job = job_id, node = %node, parent = %parent, error = %e, "Failed to send leaf result");
            }
        });

        let flow = StorageQueryFlow::new(
            format!("{}@{}", job_id, self.node),
            query,
            down_sampling,
            Arc::clone(self.engine.query_pools()),
            Arc::clone(self.engine.query_statistics()),
            self.engine.config().aggregator_pool_size,
            callback,
        );
        StorageExecutor::new(database, leaf.shard_ids.clone(), flow).execute();
        Ok(())
    }
}
