//! In-process transport connecting query nodes through channels.
//!
//! Every registered node gets a dispatch thread that hands incoming
//! requests and responses to its [`TaskService`] in arrival order.

use super::{
    ServerStream, TaskClient, TaskClientFactory, TaskRequest, TaskResponse, TaskServerFactory,
    TaskService,
};
use crate::{LinDbError, Result};
use crossbeam_channel::{Sender, unbounded};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

enum Message {
    Request(TaskRequest),
    Response(TaskResponse),
}

struct Envelope {
    from: String,
    message: Message,
}

#[derive(Default)]
struct Inner {
    nodes: DashMap<String, Sender<Envelope>>,
    disconnected: DashSet<String>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn is_reachable(&self, node: &str) -> bool {
        self.nodes.contains_key(node) && !self.disconnected.contains(node)
    }

    fn deliver(&self, from: &str, target: &str, message: Message) -> Result<()> {
        if self.disconnected.contains(from) || self.disconnected.contains(target) {
            return Err(LinDbError::ChannelSend {
                channel: format!("{from} -> {target} disconnected"),
            });
        }
        let sender = self
            .nodes
            .get(target)
            .map(|s| s.value().clone())
            .ok_or_else(|| LinDbError::ChannelSend {
                channel: format!("{from} -> {target} unknown node"),
            })?;
        sender
            .send(Envelope {
                from: from.to_string(),
                message,
            })
            .map_err(|_| LinDbError::ChannelSend {
                channel: format!("{from} -> {target}"),
            })
    }
}

/// A set of in-process nodes that can reach each other by indicator.
#[derive(Default)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the dispatch thread of `node`.
    pub fn register(&self, node: impl Into<String>, service: Arc<dyn TaskService>) -> Result<()> {
        let node = node.into();
        let (sender, receiver) = unbounded::<Envelope>();
        let name = node.clone();
        let handle = thread::Builder::new()
            .name(format!("rpc-{node}"))
            .spawn(move || {
                debug!(node = %name, "Dispatch thread started");
                for envelope in receiver.iter() {
                    let result = catch_unwind(AssertUnwindSafe(|| match envelope.message {
                        Message::Request(req) => service.handle_request(&envelope.from, req),
                        Message::Response(resp) => service.handle_response(&envelope.from, resp),
                    }));
                    if result.is_err() {
                        error!(node = %name, from = %envelope.from, "Task service panicked");
                    }
                }
                debug!(node = %name, "Dispatch thread stopped");
            })?;
        self.inner.threads.lock().push(handle);
        self.inner.nodes.insert(node.clone(), sender);
        self.inner.disconnected.remove(&node);
        info!(node = %node, "Node registered");
        Ok(())
    }

    /// Makes `node` unreachable; sends to and from it fail until it is
    /// registered again.
    pub fn disconnect(&self, node: &str) {
        self.inner.disconnected.insert(node.to_string());
    }

    pub fn reconnect(&self, node: &str) {
        self.inner.disconnected.remove(node);
    }

    /// Clients used by `node` to send requests to its children.
    pub fn client_factory(&self, node: impl Into<String>) -> Arc<dyn TaskClientFactory> {
        Arc::new(LocalClientFactory {
            from: node.into(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Streams used by `node` to answer its parents.
    pub fn server_factory(&self, node: impl Into<String>) -> Arc<dyn TaskServerFactory> {
        Arc::new(LocalServerFactory {
            from: node.into(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stops every dispatch thread after the queued messages are handled.
    pub fn shutdown(&self) {
        self.inner.nodes.clear();
        let threads: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!("Dispatch thread panicked during shutdown");
            }
        }
    }
}

impl Drop for LocalNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LocalClientFactory {
    from: String,
    inner: Arc<Inner>,
}

impl TaskClientFactory for LocalClientFactory {
    fn get_task_client(&self, target: &str) -> Option<Arc<dyn TaskClient>> {
        if !self.inner.nodes.contains_key(target) {
            return None;
        }
        Some(Arc::new(LocalClient {
            from: self.from.clone(),
            target: target.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct LocalClient {
    from: String,
    target: String,
    inner: Arc<Inner>,
}

impl TaskClient for LocalClient {
    fn send(&self, req: TaskRequest) -> Result<()> {
        self.inner
            .deliver(&self.from, &self.target, Message::Request(req))
    }
}

struct LocalServerFactory {
    from: String,
    inner: Arc<Inner>,
}

impl TaskServerFactory for LocalServerFactory {
    fn get_stream(&self, node: &str) -> Option<Arc<dyn ServerStream>> {
        if !self.inner.is_reachable(node) {
            return None;
        }
        Some(Arc::new(LocalStream {
            from: self.from.clone(),
            target: node.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct LocalStream {
    from: String,
    target: String,
    inner: Arc<Inner>,
}

impl ServerStream for LocalStream {
    fn send(&self, resp: TaskResponse) -> Result<()> {
        self.inner
            .deliver(&self.from, &self.target, Message::Response(resp))
    }
}
