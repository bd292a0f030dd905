//! Concurrency utilities for lindb.

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::{LinDbError, Result};

/// A unit of work executed by a closure pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A named pool of worker threads for concurrent task execution.
///
/// Submission blocks while the bounded queue is full, which is the
/// back-pressure point for producers.
pub struct WorkerPool<T: Send + 'static> {
    name: String,
    workers: Mutex<Vec<Worker>>,
    sender: Sender<Message<T>>,
    shutdown: Arc<AtomicBool>,
    in_flight_tasks: Arc<AtomicUsize>,
    panicked_tasks: Arc<AtomicUsize>,
    inline_handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

enum Message<T> {
    Task(T),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl WorkerPool<Task> {
    /// Creates a pool that runs submitted closures.
    pub fn for_closures(name: impl Into<String>, num_workers: usize) -> Self {
        Self::new(name, num_workers, |task: Task| task())
    }

    /// Submits a closure to the pool.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(f))
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a new worker pool with the specified number of workers.
    pub fn new<F>(name: impl Into<String>, num_workers: usize, task_handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = name.into();
        let num_workers = if num_workers == 0 {
            warn!(pool = %name, "WorkerPool::new called with 0 workers; defaulting to 1");
            1
        } else {
            num_workers
        };

        let queue_capacity = num_workers.saturating_mul(2).max(1);
        let (sender, receiver) = bounded::<Message<T>>(queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight_tasks = Arc::new(AtomicUsize::new(0));
        let panicked_tasks = Arc::new(AtomicUsize::new(0));
        let task_handler: Arc<dyn Fn(T) + Send + Sync> = Arc::new(task_handler);

        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight_tasks = Arc::clone(&in_flight_tasks);
            let panicked_tasks = Arc::clone(&panicked_tasks);
            let task_handler = Arc::clone(&task_handler);
            let pool_name = name.clone();

            let thread_result = thread::Builder::new()
                .name(format!("{}-worker-{}", name, id))
                .spawn(move || {
                    debug!(pool = %pool_name, "Worker {} started", id);

                    loop {
                        let message = match receiver.recv_timeout(Duration::from_millis(100)) {
                            Ok(msg) => msg,
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                                debug!(pool = %pool_name, "Worker {} channel disconnected", id);
                                break;
                            }
                        };

                        match message {
                            Message::Task(task) => {
                                let result =
                                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                        task_handler(task)
                                    }));
                                in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                                if result.is_err() {
                                    panicked_tasks.fetch_add(1, Ordering::AcqRel);
                                    error!(pool = %pool_name, "Worker {} task handler panicked", id);
                                }
                            }
                            Message::Shutdown => {
                                debug!(pool = %pool_name, "Worker {} received shutdown signal", id);
                                break;
                            }
                        }
                    }
                });

            match thread_result {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!(pool = %name, "Failed to spawn worker thread {}: {}", id, e);
                    break;
                }
            }
        }

        let inline_handler = if workers.is_empty() {
            warn!(
                pool = %name,
                "WorkerPool failed to spawn workers; tasks will execute inline on submit caller thread"
            );
            Some(task_handler)
        } else {
            None
        };

        Self {
            name,
            workers: Mutex::new(workers),
            sender,
            shutdown,
            in_flight_tasks,
            panicked_tasks,
            inline_handler,
        }
    }

    /// Submits a task to the worker pool.
    #[instrument(skip(self, task), fields(pool = %self.name))]
    pub fn submit(&self, task: T) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(LinDbError::EngineShuttingDown);
        }

        if let Some(handler) = &self.inline_handler {
            self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
            self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            if result.is_err() {
                self.panicked_tasks.fetch_add(1, Ordering::AcqRel);
                return Err(LinDbError::TaskPanicked(format!(
                    "{} inline task handler panicked",
                    self.name
                )));
            }
            return Ok(());
        }

        self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Task(task))
            .map_err(|_| LinDbError::ChannelSend {
                channel: self.name.clone(),
            })
            .inspect_err(|_| {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            })?;

        Ok(())
    }

    /// Returns the number of in-flight tasks (queued or currently running).
    pub fn active_tasks(&self) -> usize {
        self.in_flight_tasks.load(Ordering::Acquire)
    }

    /// Returns how many tasks panicked inside a worker.
    pub fn panicked_tasks(&self) -> usize {
        self.panicked_tasks.load(Ordering::Acquire)
    }

    /// Waits for all in-flight tasks (queued or running) to complete with a timeout.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        while self.in_flight_tasks.load(Ordering::Acquire) > 0 {
            if start.elapsed() > timeout {
                return Err(LinDbError::ChannelTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(Duration::from_millis(5));
        }

        Ok(())
    }

    /// Shuts down the worker pool gracefully, draining queued tasks first.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(pool = %self.name, "Shutting down worker pool");

        self.wait_for_completion(Duration::from_secs(30))?;

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }

        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(_) => debug!(pool = %self.name, "Worker {} shut down successfully", worker.id),
                    Err(_) => error!(pool = %self.name, "Worker {} panicked during shutdown", worker.id),
                }
            }
        }

        Ok(())
    }
}
