//! Background job system: queue, retry policy and the worker pool.
//!
//! ## Design
//!
//! - Four job kinds (RETRAIN, PREDICT, EVALUATE, CLEANUP) routed to registered handlers
//! - Retry with capped exponential backoff; cold starts back off longer
//! - Abandoned jobs raise an operational alert instead of silently disappearing
//! - At-least-once delivery through visibility leases; handlers must be idempotent

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, InvariantHook, JobHandler, RetrainGate, RetrainPermit, WorkerPool, WorkerPoolHandle};
pub use store::{ClaimFilter, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    Job, JobAttemptRecord, JobKind, JobOrigin, JobPayload, JobResult, JobStatus, JobStatusFilter,
    RetryPolicy,
};
