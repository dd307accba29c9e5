//! Infrastructure layer: queue, worker pool, scheduler, model store, sinks and data sources.

pub mod data;
pub mod jobs;
pub mod model_store;
pub mod pg;
pub mod pipeline;
pub mod scheduler;
pub mod sink;


pub use data::{InMemoryDataSource, PostgresDataSource};
pub use jobs::{InMemoryJobStore, Job, JobKind, JobStatus, JobStore, WorkerPool};
pub use model_store::{FsModelStore, InMemoryModelStore, ModelStore};
pub use pg::PgContext;
pub use pipeline::{AlertNotifier, InMemoryNotifier, Pipeline, TracingNotifier};
pub use scheduler::{SchedulerHealth, TaskScheduler};
pub use sink::{InMemoryResultSink, PostgresResultSink, PredictionQuery, ResultSink};
