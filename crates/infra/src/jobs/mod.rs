//! Deferred settlement work with retry, backoff, and dead-letter handling.
//!
//! - `Job`: one unit of deferred work and its retry state
//! - `JobStore`: persistence for jobs and the dead-letter queue
//! - `JobExecutor`: polls the store and runs handlers on the tokio runtime
//! - `JobScheduler`: enqueues growth, payout and unlock jobs
//! - `retry`: bounded in-process retry for a single step

pub mod executor;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use retry::run_with_retry;
pub use scheduler::JobScheduler;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus, RetryPolicy,
};
