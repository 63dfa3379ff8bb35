//! Operator surface over the queue.

use std::sync::Arc;

use tracing::info;

use sandcastle_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{CancelOutcome, Job, JobFilter, JobState, JobStats, QueueSettings};

/// Inspection and control of jobs and queue settings.
#[derive(Clone)]
pub struct QueueAdmin {
    store: Arc<dyn JobStore>,
}

impl QueueAdmin {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(filter).await
    }

    pub async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.store.get(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError> {
        let outcome = self.store.request_cancel(id).await?;
        info!(job_id = %id, outcome = ?outcome, "job cancel requested");
        Ok(outcome)
    }

    /// Re-run a terminal job as a new job. Returns the new job.
    pub async fn retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.retry(id).await?;
        info!(job_id = %id, new_job_id = %job.id, "job retried");
        Ok(job)
    }

    /// Clear a stuck lease.
    pub async fn force_unlock(&self, id: JobId) -> Result<bool, JobStoreError> {
        let unlocked = self.store.force_unlock(id).await?;
        info!(job_id = %id, unlocked, "job force-unlocked");
        Ok(unlocked)
    }

    pub async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.store.delete(id).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    pub async fn delete_by_state(&self, state: JobState) -> Result<u64, JobStoreError> {
        let deleted = self.store.delete_by_state(state).await?;
        info!(state = %state, deleted, "jobs deleted");
        Ok(deleted)
    }

    pub async fn settings(&self) -> Result<QueueSettings, JobStoreError> {
        self.store.settings().await
    }

    pub async fn pause(&self) -> Result<QueueSettings, JobStoreError> {
        let settings = self.store.set_paused(true).await?;
        info!("queue paused");
        Ok(settings)
    }

    pub async fn resume(&self) -> Result<QueueSettings, JobStoreError> {
        let settings = self.store.set_paused(false).await?;
        info!("queue resumed");
        Ok(settings)
    }

    pub async fn set_concurrency(&self, concurrency: u32) -> Result<QueueSettings, JobStoreError> {
        let settings = self.store.set_concurrency(concurrency).await?;
        info!(concurrency = settings.concurrency, "queue concurrency changed");
        Ok(settings)
    }
}
