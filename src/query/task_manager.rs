//! Registry of the tasks a node is waiting on, and the send paths down and
//! up the task tree.

use super::context::TaskContext;
use crate::metrics::QueryStatistics;
use crate::rpc::{TaskClientFactory, TaskRequest, TaskResponse, TaskServerFactory};
use crate::{LinDbError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub struct TaskManager {
    node: String,
    seq: AtomicU64,
    tasks: DashMap<String, Arc<TaskContext>>,
    client_factory: Arc<dyn TaskClientFactory>,
    server_factory: Arc<dyn TaskServerFactory>,
    stats: Arc<QueryStatistics>,
}

impl TaskManager {
    pub fn new(
        node: impl Into<String>,
        client_factory: Arc<dyn TaskClientFactory>,
        server_factory: Arc<dyn TaskServerFactory>,
        stats: Arc<QueryStatistics>,
    ) -> Self {
        Self {
            node: node.into(),
            seq: AtomicU64::new(0),
            tasks: DashMap::new(),
            client_factory,
            server_factory,
            stats,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Task ids are unique per node.
    pub fn alloc_task_id(&self) -> String {
        format!("{}-{}", self.node, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Registers `ctx` and sends `req` to every target. Every target must
    /// have a client before anything is sent. A failed send unregisters the
    /// task; requests already delivered to other targets are not recalled.
    pub fn submit(&self, ctx: Arc<TaskContext>, targets: &[String], req: &TaskRequest) -> Result<()> {
        let mut clients = Vec::with_capacity(targets.len());
        for target in targets {
            match self.client_factory.get_task_client(target) {
                Some(client) => clients.push((target, client)),
                None => {
                    self.stats.task_send_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(LinDbError::NoTaskSender(target.clone()));
                }
            }
        }

        let task_id = ctx.task_id().to_string();
        self.tasks.insert(task_id.clone(), ctx);
        for (target, client) in clients {
            if let Err(e) = client.send(req.clone()) {
                self.tasks.remove(&task_id);
                self.stats.task_send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task_id, target = %target, error = %e, "Failed to send task");
                return Err(LinDbError::TaskSend {
                    node: target.clone(),
                    details: e.to_string(),
                });
            }
            self.stats.tasks_sent.fetch_add(1, Ordering::Relaxed);
            debug!(task = %task_id, target = %target, "Task sent");
        }
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        self.tasks.get(task_id).map(|t| Arc::clone(t.value()))
    }

    /// Unregisters a finished task.
    pub fn complete(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        self.tasks.remove(task_id).map(|(_, ctx)| ctx)
    }

    pub fn num_of_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Sends a response up to `parent_node`.
    pub fn send_response(&self, parent_node: &str, resp: TaskResponse) -> Result<()> {
        let stream = self
            .server_factory
            .get_stream(parent_node)
            .ok_or_else(|| LinDbError::NoSendStream(parent_node.to_string()))?;
        stream.send(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::context::TaskType;
    use crate::rpc::{ServerStream, TaskClient};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockNet {
        sent: Mutex<Vec<String>>,
        broken: Vec<String>,
        known: Vec<String>,
    }

    struct MockClient {
        target: String,
        net: Arc<MockNet>,
    }

    impl TaskClient for MockClient {
        fn send(&self, _req: TaskRequest) -> Result<()> {
            if self.net.broken.contains(&self.target) {
                return Err(LinDbError::ChannelSend {
                    channel: self.target.clone(),
                });
            }
            self.net.sent.lock().push(self.target.clone());
            Ok(())
        }
    }

    struct Factory(Arc<MockNet>);

    impl TaskClientFactory for Factory {
        fn get_task_client(&self, target: &str) -> Option<Arc<dyn TaskClient>> {
            self.0.known.iter().any(|k| k == target).then(|| {
                Arc::new(MockClient {
                    target: target.to_string(),
                    net: Arc::clone(&self.0),
                }) as Arc<dyn TaskClient>
            })
        }
    }

    impl TaskServerFactory for Factory {
        fn get_stream(&self, _node: &str) -> Option<Arc<dyn ServerStream>> {
            None
        }
    }

    fn manager(net: MockNet) -> (TaskManager, Arc<MockNet>) {
        let net = Arc::new(net);
        let factory = Arc::new(Factory(Arc::clone(&net)));
        (
            TaskManager::new(
                "broker",
                factory.clone(),
                factory,
                Arc::new(QueryStatistics::default()),
            ),
            net,
        )
    }

    fn request() -> TaskRequest {
        TaskRequest {
            job_id: 1,
            parent_task_id: "broker-1".into(),
            physical_plan: Vec::new(),
            payload: Vec::new(),
        }
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn submit_registers_and_sends() {
        let (tm, net) = manager(MockNet {
            known: targets(&["a", "b"]),
            ..Default::default()
        });
        let id = tm.alloc_task_id();
        assert_eq!(id, "broker-1");
        let ctx = Arc::new(TaskContext::new(&id, TaskType::Root, 1, "", "", 2));
        tm.submit(ctx, &targets(&["a", "b"]), &request()).unwrap();
        assert_eq!(*net.sent.lock(), vec!["a", "b"]);
        assert!(tm.get(&id).is_some());
        assert!(tm.complete(&id).is_some());
        assert_eq!(tm.num_of_tasks(), 0);
    }

    #[test]
    fn missing_client_sends_nothing() {
        let (tm, net) = manager(MockNet {
            known: targets(&["a"]),
            ..Default::default()
        });
        let ctx = Arc::new(TaskContext::new("t", TaskType::Root, 1, "", "", 2));
        let err = tm.submit(ctx, &targets(&["a", "b"]), &request()).unwrap_err();
        assert!(matches!(err, LinDbError::NoTaskSender(node) if node == "b"));
        assert!(net.sent.lock().is_empty());
        assert_eq!(tm.num_of_tasks(), 0);
    }

    #[test]
    fn send_failure_is_best_effort() {
        let (tm, net) = manager(MockNet {
            known: targets(&["a", "b"]),
            broken: targets(&["b"]),
            ..Default::default()
        });
        let ctx = Arc::new(TaskContext::new("t", TaskType::Root, 1, "", "", 2));
        let err = tm.submit(ctx, &targets(&["a", "b"]), &request()).unwrap_err();
        assert!(matches!(err, LinDbError::TaskSend { node, .. } if node == "b"));
        assert_eq!(*net.sent.lock(), vec!["a"]);
        assert!(tm.get("t").is_none());
        assert!(matches!(
            tm.send_response("root", TaskResponse::default()),
            Err(LinDbError::NoSendStream(_))
        ));
    }
}
