//! Handler contract and registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sandcastle_core::{DomainError, JobId, ProjectId};

use super::enqueue::{EnqueueError, JobQueue};
use super::payload::{self, JobPayload};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobType, ProjectCancelSummary};

/// What a handler asks the worker loop to do with its job.
#[derive(Debug)]
pub enum JobOutcome {
    /// Done; the job becomes `succeeded`.
    Success,
    /// Not ready yet; requeue after the delay without counting an attempt.
    Reschedule(Duration),
    /// The handler observed a cancel request and stopped.
    Cancelled,
    /// Failed; retried with backoff unless the error is permanent or
    /// retries are exhausted.
    Failure(HandlerError),
}

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// Unrecoverable; the job fails without further retries.
    #[error("{0}")]
    Permanent(String),
    /// May succeed on a later attempt.
    #[error("{0}")]
    Transient(String),
    #[error("job store: {0}")]
    Store(#[from] JobStoreError),
    /// The lease was reclaimed by another worker; nothing may be written back.
    #[error("lease lost")]
    LeaseLost,
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether retrying can never help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::InvalidPayload(_) | HandlerError::Permanent(_))
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(_) | DomainError::InvalidId { .. } => {
                HandlerError::InvalidPayload(err.to_string())
            }
            _ => HandlerError::Permanent(err.to_string()),
        }
    }
}

impl From<EnqueueError> for HandlerError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Invalid { .. } => HandlerError::InvalidPayload(err.to_string()),
            EnqueueError::Store(e) => HandlerError::Store(e),
        }
    }
}

/// Everything a handler gets to see about the job it runs.
pub struct JobContext {
    job: Job,
    worker_id: String,
    lease: Duration,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub fn new(
        job: Job,
        worker_id: impl Into<String>,
        lease: Duration,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            lease,
            store,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Decode and validate the payload.
    pub fn payload<P: JobPayload>(&self) -> Result<P, HandlerError> {
        payload::decode(&self.job).map_err(|e| HandlerError::InvalidPayload(e.to_string()))
    }

    /// Enqueue API for chaining the next pipeline step. Chained jobs keep
    /// this job's `max_attempts`.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store.clone()).with_max_attempts(self.job.max_attempts)
    }

    /// Whether a cancel was requested for this job.
    pub async fn cancel_requested(&self) -> Result<bool, HandlerError> {
        Ok(self.store.cancel_requested_at(self.job.id).await?.is_some())
    }

    /// Cancel every other unfinished job of `project_id`.
    pub async fn cancel_other_project_jobs(
        &self,
        project_id: &ProjectId,
    ) -> Result<ProjectCancelSummary, HandlerError> {
        Ok(self
            .store
            .request_cancel_for_project(project_id, Some(self.job.id))
            .await?)
    }

    /// Extend the lease; [`HandlerError::LeaseLost`] if another worker owns the job now.
    pub async fn heartbeat(&self) -> Result<(), HandlerError> {
        if self
            .store
            .heartbeat(self.job.id, &self.worker_id, self.lease)
            .await?
        {
            Ok(())
        } else {
            Err(HandlerError::LeaseLost)
        }
    }

    /// Heartbeat, then report whether a cancel was requested.
    ///
    /// Long-running handlers call this at every wait point.
    pub async fn checkpoint(&self) -> Result<bool, HandlerError> {
        self.heartbeat().await?;
        self.cancel_requested().await
    }
}

/// A job handler. One contract for every job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError>;
}

/// Job type -> handler mapping, populated at process start.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert(job_type.as_str().to_string(), Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(job_type.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .finish()
    }
}
