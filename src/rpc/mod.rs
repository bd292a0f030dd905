//! Task messages exchanged between query nodes and the transport seams.
//!
//! Nodes are named by an indicator string. A node sends requests down the
//! task tree through [`TaskClient`]s and answers up the tree through
//! [`ServerStream`]s; both are looked up by target node and may be absent
//! when the peer is unknown or disconnected.

pub mod local;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalNetwork;

/// Request travelling from a parent task to a child node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub job_id: u64,
    /// Task id on the sending node; the response carries it back.
    pub parent_task_id: String,
    pub physical_plan: Vec<u8>,
    /// Encoded query.
    pub payload: Vec<u8>,
}

/// Response travelling from a child back to its parent task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub job_id: u64,
    pub task_id: String,
    /// Set on the last response of a child.
    pub completed: bool,
    /// Encoded partial result.
    pub payload: Vec<u8>,
    pub err_msg: String,
    /// Node that produced the response.
    pub send_node: String,
}

impl TaskResponse {
    pub fn is_error(&self) -> bool {
        !self.err_msg.is_empty()
    }
}

pub trait TaskClient: Send + Sync {
    fn send(&self, req: TaskRequest) -> Result<()>;
}

pub trait TaskClientFactory: Send + Sync {
    fn get_task_client(&self, target: &str) -> Option<Arc<dyn TaskClient>>;
}

pub trait ServerStream: Send + Sync {
    fn send(&self, resp: TaskResponse) -> Result<()>;
}

pub trait TaskServerFactory: Send + Sync {
    fn get_stream(&self, node: &str) -> Option<Arc<dyn ServerStream>>;
}

/// Receiving side of a query node.
pub trait TaskService: Send + Sync {
    fn handle_request(&self, from: &str, req: TaskRequest);
    fn handle_response(&self, from: &str, resp: TaskResponse);
}
