//! Job store abstraction.
//!
//! Every transition that finishes or requeues a running job is conditional on
//! `lease_owner == worker_id`. A write from a worker whose lease was reclaimed
//! returns `false` and changes nothing, so the current owner stays
//! authoritative.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sandcastle_core::{JobId, ProjectId};

use super::types::{
    CancelOutcome, Job, JobFilter, JobState, JobStats, NewJob, ProjectCancelSummary, QueueSettings,
};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `queued` job.
    async fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Atomically claim the oldest eligible queued job.
    ///
    /// Eligible: `state = queued` and `available_at <= now`, ordered by
    /// `available_at` then `created_at`. The claimed job is `running` with
    /// `lease_owner = worker_id` and `lease_expires_at = now + lease`.
    /// `None` when nothing is eligible.
    async fn claim_next(&self, worker_id: &str, lease: Duration)
    -> Result<Option<Job>, JobStoreError>;

    /// Push the lease forward. `false` when the job is no longer owned by `worker_id`.
    async fn heartbeat(&self, id: JobId, worker_id: &str, lease: Duration)
    -> Result<bool, JobStoreError>;

    /// Requeue running jobs whose lease expired (cancel them instead when a
    /// cancel was requested). Returns how many jobs were recovered.
    async fn recover_expired(&self) -> Result<u64, JobStoreError>;

    /// `running` -> `succeeded`.
    async fn complete(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError>;

    /// `running` -> `queued` after `delay` without counting an attempt.
    ///
    /// A pending cancel request turns this into `cancelled`.
    async fn reschedule(&self, id: JobId, worker_id: &str, delay: Duration)
    -> Result<bool, JobStoreError>;

    /// `running` -> `queued` with the new attempt count, after `delay`.
    ///
    /// A pending cancel request turns this into `cancelled`.
    async fn schedule_retry(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<bool, JobStoreError>;

    /// `running` -> `failed`.
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<bool, JobStoreError>;

    /// `running` -> `cancelled` (the handler acknowledged a cancel request).
    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError>;

    /// `running` -> `queued` immediately, without counting an attempt.
    /// Used when a worker shuts down with work still in flight.
    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError>;

    /// Cancel a queued job immediately, or flag a running one.
    async fn request_cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError>;

    async fn cancel_requested_at(&self, id: JobId)
    -> Result<Option<DateTime<Utc>>, JobStoreError>;

    /// [`JobStore::request_cancel`] for every non-terminal job of a project.
    async fn request_cancel_for_project(
        &self,
        project_id: &ProjectId,
        except: Option<JobId>,
    ) -> Result<ProjectCancelSummary, JobStoreError>;

    /// Clone a terminal job as a new queued job with a fresh id.
    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Administratively clear a lease: `running` -> `queued`, or `cancelled`
    /// when a cancel was already requested. `false` if the job was not running.
    async fn force_unlock(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Delete a terminal job.
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Delete every job in a terminal `state`.
    async fn delete_by_state(&self, state: JobState) -> Result<u64, JobStoreError>;

    async fn settings(&self) -> Result<QueueSettings, JobStoreError>;

    async fn set_paused(&self, paused: bool) -> Result<QueueSettings, JobStoreError>;

    async fn set_concurrency(&self, concurrency: u32) -> Result<QueueSettings, JobStoreError>;
}

pub(crate) fn require_terminal_state(state: JobState) -> Result<(), JobStoreError> {
    if state.is_terminal() {
        Ok(())
    } else {
        Err(JobStoreError::InvalidArgument(format!(
            "only terminal states can be bulk-deleted, got {state}"
        )))
    }
}
