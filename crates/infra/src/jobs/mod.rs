//! Background job queue with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `Job` / `JobDescriptor`: a queued unit of work and its immutable view
//! - `JobQueue` / `WorkQueue`: producer and worker sides of the queue
//!   (in-memory, or Redis behind the `redis` feature)
//! - `JobExecutor`: claims jobs and runs the handler registered for their kind
//! - `dedup`: "is something already queued or running for this?" queries

pub mod dedup;
pub mod executor;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod types;

pub use executor::{ExecutorStats, Execution, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueStats, RetryPolicies, WorkQueue};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use types::{
    BackoffStrategy, ChildKey, DeadLetterEntry, Job, JobDescriptor, JobId, JobKind, JobOptions, JobResult,
    JobStatus, RequestId, RetryPolicy,
};
