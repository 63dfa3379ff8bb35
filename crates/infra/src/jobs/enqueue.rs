//! Enqueue API used by non-queue code and by handlers chaining the next step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use sandcastle_core::{DomainError, JobId};

use super::payload::{
    DockerComposeUp, DockerStop, DockerWaitReady, JobPayload, OpencodeSendInitialPrompt,
    OpencodeSendUserPrompt, OpencodeSessionCreate, ProductionBuild, ProductionStart,
    ProductionStop, ProductionWaitReady, ProjectCreate, ProjectDelete, ProjectsDeleteAllForUser,
};
use super::store::{JobStore, JobStoreError};
use super::types::{JobType, NewJob, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid {job_type} payload: {source}")]
    Invalid {
        job_type: JobType,
        #[source]
        source: DomainError,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Validating front door to the job store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Validate `payload` and insert it as a new queued job.
    pub async fn enqueue<P: JobPayload>(&self, payload: &P) -> Result<JobId, EnqueueError> {
        self.insert(payload, None).await
    }

    /// Like [`JobQueue::enqueue`], but not claimable before `at`.
    pub async fn enqueue_at<P: JobPayload>(
        &self,
        payload: &P,
        at: DateTime<Utc>,
    ) -> Result<JobId, EnqueueError> {
        self.insert(payload, Some(at)).await
    }

    /// Enqueue an untyped payload, validating it against the schema of `job_type`.
    pub async fn enqueue_json(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, EnqueueError> {
        fn parse<P: JobPayload>(value: serde_json::Value) -> Result<P, EnqueueError> {
            serde_json::from_value(value).map_err(|e| EnqueueError::Invalid {
                job_type: P::JOB_TYPE,
                source: DomainError::validation(e.to_string()),
            })
        }

        match job_type {
            JobType::ProjectCreate => self.enqueue(&parse::<ProjectCreate>(payload)?).await,
            JobType::DockerComposeUp => self.enqueue(&parse::<DockerComposeUp>(payload)?).await,
            JobType::DockerWaitReady => self.enqueue(&parse::<DockerWaitReady>(payload)?).await,
            JobType::OpencodeSessionCreate => {
                self.enqueue(&parse::<OpencodeSessionCreate>(payload)?).await
            }
            JobType::OpencodeSendInitialPrompt => {
                self.enqueue(&parse::<OpencodeSendInitialPrompt>(payload)?)
                    .await
            }
            JobType::OpencodeSendUserPrompt => {
                self.enqueue(&parse::<OpencodeSendUserPrompt>(payload)?).await
            }
            JobType::ProductionBuild => self.enqueue(&parse::<ProductionBuild>(payload)?).await,
            JobType::ProductionStart => self.enqueue(&parse::<ProductionStart>(payload)?).await,
            JobType::ProductionWaitReady => {
                self.enqueue(&parse::<ProductionWaitReady>(payload)?).await
            }
            JobType::ProductionStop => self.enqueue(&parse::<ProductionStop>(payload)?).await,
            JobType::DockerStop => self.enqueue(&parse::<DockerStop>(payload)?).await,
            JobType::ProjectDelete => self.enqueue(&parse::<ProjectDelete>(payload)?).await,
            JobType::ProjectsDeleteAllForUser => {
                self.enqueue(&parse::<ProjectsDeleteAllForUser>(payload)?)
                    .await
            }
        }
    }

    async fn insert<P: JobPayload>(
        &self,
        payload: &P,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, EnqueueError> {
        let invalid = |source| EnqueueError::Invalid {
            job_type: P::JOB_TYPE,
            source,
        };
        payload.validate().map_err(invalid)?;
        let value = serde_json::to_value(payload)
            .map_err(|e| invalid(DomainError::validation(e.to_string())))?;

        let mut job = NewJob::new(P::JOB_TYPE, value).with_max_attempts(self.max_attempts);
        if let Some(project_id) = payload.project_id() {
            job = job.for_project(project_id.clone());
        }
        if let Some(at) = available_at {
            job = job.available_at(at);
        }

        let job = self.store.enqueue(job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job.id)
    }

    pub async fn project_create(&self, payload: ProjectCreate) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn docker_compose_up(&self, payload: DockerComposeUp) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn docker_wait_ready(&self, payload: DockerWaitReady) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn opencode_session_create(
        &self,
        payload: OpencodeSessionCreate,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn opencode_send_initial_prompt(
        &self,
        payload: OpencodeSendInitialPrompt,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn opencode_send_user_prompt(
        &self,
        payload: OpencodeSendUserPrompt,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn production_build(&self, payload: ProductionBuild) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn production_start(&self, payload: ProductionStart) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn production_wait_ready(
        &self,
        payload: ProductionWaitReady,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn production_stop(&self, payload: ProductionStop) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn docker_stop(&self, payload: DockerStop) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn project_delete(&self, payload: ProjectDelete) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }

    pub async fn projects_delete_all_for_user(
        &self,
        payload: ProjectsDeleteAllForUser,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(&payload).await
    }
}
