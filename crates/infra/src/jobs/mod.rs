//! Durable job queue and worker engine.
//!
//! ## Design
//!
//! - Jobs are rows in a shared store; any number of workers claim them with
//!   time-bounded leases
//! - A lease that is not renewed expires and the job is requeued
//! - Failures retry with capped exponential backoff up to `max_attempts`
//! - Handlers may reschedule themselves ("not ready yet") without spending an
//!   attempt
//! - Cancellation is cooperative: queued jobs are cancelled at once, running
//!   jobs are flagged and the handler stops at its next checkpoint
//!
//! ## Components
//!
//! - `JobStore`: persistence contract (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobQueue`: validated, typed enqueue
//! - `JobExecutor`: the worker loop
//! - `HandlerRegistry` / `JobHandler`: job type to handler dispatch
//! - `QueueAdmin`: inspection and operator controls

pub mod admin;
pub mod clock;
pub mod enqueue;
pub mod executor;
pub mod handler;
pub mod in_memory;
pub mod payload;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use admin::QueueAdmin;
pub use clock::{Clock, ManualClock, SystemClock};
pub use enqueue::{EnqueueError, JobQueue};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, Settled};
pub use handler::{HandlerError, HandlerRegistry, JobContext, JobHandler, JobOutcome};
pub use in_memory::InMemoryJobStore;
pub use payload::JobPayload;
pub use postgres::PostgresJobStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{JobStore, JobStoreError};
pub use types::{
    CancelOutcome, Job, JobFilter, JobState, JobStats, JobType, NewJob, ProjectCancelSummary,
    QueueSettings, DEFAULT_MAX_ATTEMPTS,
};
