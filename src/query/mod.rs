//! Distributed query execution.
//!
//! A root node builds a [`PhysicalPlan`] and submits a job; the request
//! travels through optional intermediate nodes to the leaves holding the
//! shards. Leaves run a [`StorageQueryFlow`] over their local families and
//! send partial aggregates up, where they are merged until the root turns
//! them into a [`ResultSet`].

pub mod aggregation;
pub mod context;
pub mod downsampling;
pub mod executor;
pub mod flow;
pub mod handler;
pub mod intermediate;
pub mod job_manager;
pub mod leaf;
pub mod model;
pub mod plan;
pub mod receiver;
pub mod stage;
pub mod task_manager;

pub use aggregation::FieldAggregator;
pub use context::{TaskContext, TaskType};
pub use downsampling::DownSampling;
pub use executor::StorageExecutor;
pub use flow::{FlowCallback, StorageQueryFlow};
pub use handler::TaskHandler;
pub use intermediate::IntermediateTaskProcessor;
pub use job_manager::{JobContext, JobManager};
pub use leaf::LeafTaskProcessor;
pub use model::{
    AggFunc, AggPoint, FieldPoints, FieldSpec, PartialResult, Query, ResultSet, SeriesResult,
    TagFilter,
};
pub use plan::{Intermediate, Leaf, PhysicalPlan, PlanBuilder, Root};
pub use receiver::TaskReceiver;
pub use stage::{QueryPools, Stage};
pub use task_manager::TaskManager;
