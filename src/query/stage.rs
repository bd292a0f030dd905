//! Execution stages of a storage query and the worker pools running them.

use crate::concurrency::{Task, WorkerPool};
use crate::config::QueryPoolConfig;
use crate::Result;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Filtering,
    Grouping,
    Scanner,
    DownSampling,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Filtering => "filtering",
            Stage::Grouping => "grouping",
            Stage::Scanner => "scanner",
            Stage::DownSampling => "down-sampling",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three named pools of one storage engine. Work only flows from
/// filtering to grouping to scanner, never back, so a full queue downstream
/// cannot block a pool on itself.
pub struct QueryPools {
    filtering: WorkerPool<Task>,
    grouping: WorkerPool<Task>,
    scanner: WorkerPool<Task>,
}

impl QueryPools {
    pub fn new(config: &QueryPoolConfig) -> Self {
        Self {
            filtering: WorkerPool::for_closures("query-filtering", config.filtering),
            grouping: WorkerPool::for_closures("query-grouping", config.grouping),
            scanner: WorkerPool::for_closures("query-scanner", config.scanner),
        }
    }

    /// Pool a stage runs on; down-sampling runs with scanning.
    pub fn pool(&self, stage: Stage) -> &WorkerPool<Task> {
        match stage {
            Stage::Filtering => &self.filtering,
            Stage::Grouping => &self.grouping,
            Stage::Scanner | Stage::DownSampling => &self.scanner,
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.filtering.shutdown()?;
        self.grouping.shutdown()?;
        self.scanner.shutdown()
    }
}
