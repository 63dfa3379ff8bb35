//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sandcastle_core::{JobId, ProjectId};

use super::clock::{to_chrono, Clock, SystemClock};
use super::store::{require_terminal_state, JobStore, JobStoreError};
use super::types::{
    CancelOutcome, Job, JobFilter, JobState, JobStats, NewJob, ProjectCancelSummary, QueueSettings,
};

/// In-memory job store.
///
/// One mutex guards every job, so each operation is a single atomic
/// transition, the same guarantee the Postgres store gets from row locks.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
    settings: QueueSettings,
}

#[derive(Debug)]
struct Entry {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    job: Job,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id, Entry { seq, job });
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(&id)
            .map(|e| &mut e.job)
            .ok_or(JobStoreError::NotFound(id))
    }

    /// The job, if it is running under `worker_id`'s lease.
    fn owned_mut(&mut self, id: JobId, worker_id: &str) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .map(|e| &mut e.job)
            .filter(|job| job.is_owned_by(worker_id))
    }
}

fn clear_lease(job: &mut Job) {
    job.lease_owner = None;
    job.lease_expires_at = None;
}

fn requeue(job: &mut Job, available_at: DateTime<Utc>, now: DateTime<Utc>) {
    if job.cancel_requested_at.is_some() {
        job.state = JobState::Cancelled;
    } else {
        job.state = JobState::Queued;
        job.available_at = available_at;
    }
    clear_lease(job);
    job.updated_at = now;
}

fn cancel(job: &mut Job, now: DateTime<Utc>) -> CancelOutcome {
    match job.state {
        JobState::Queued => {
            job.state = JobState::Cancelled;
            job.cancel_requested_at = Some(now);
            job.updated_at = now;
            CancelOutcome::Cancelled
        }
        JobState::Running => {
            if job.cancel_requested_at.is_none() {
                job.cancel_requested_at = Some(now);
                job.updated_at = now;
            }
            CancelOutcome::Requested
        }
        state => CancelOutcome::AlreadyTerminal(state),
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let now = self.now();
        let job = Job {
            id: JobId::new(),
            job_type: new.job_type,
            payload: new.payload,
            project_id: new.project_id,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: new.max_attempts.max(1),
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested_at: None,
            available_at: new.available_at.unwrap_or(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.lock()?.insert(job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock()?;
        let mut result: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| filter.matches(&e.job))
            .collect();

        result.sort_by(|a, b| {
            (b.job.created_at, b.seq).cmp(&(a.job.created_at, a.seq))
        });
        Ok(result
            .into_iter()
            .take(filter.effective_limit())
            .map(|e| e.job.clone())
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.lock()?;
        let mut stats = JobStats::default();
        for entry in inner.jobs.values() {
            stats.record(entry.job.state, 1);
        }
        Ok(stats)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;

        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Queued && e.job.available_at <= now)
            .min_by_key(|e| (e.job.available_at, e.job.created_at, e.seq))
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = inner.job_mut(id)?;
        job.state = JobState::Running;
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + to_chrono(lease));
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                job.lease_expires_at = Some(now + to_chrono(lease));
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recover_expired(&self) -> Result<u64, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        let mut recovered = 0;
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.state == JobState::Running && job.lease_expires_at.is_some_and(|at| at < now) {
                requeue(job, now, now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn complete(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                job.state = JobState::Succeeded;
                clear_lease(job);
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        delay: Duration,
    ) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                requeue(job, now + to_chrono(delay), now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                job.attempts = attempts.min(job.max_attempts);
                job.last_error = Some(error.to_string());
                requeue(job, now + to_chrono(delay), now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                job.state = JobState::Failed;
                job.attempts = attempts.min(job.max_attempts);
                job.last_error = Some(error.to_string());
                clear_lease(job);
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                job.state = JobState::Cancelled;
                job.cancel_requested_at.get_or_insert(now);
                clear_lease(job);
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        match inner.owned_mut(id, worker_id) {
            Some(job) => {
                requeue(job, now, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn request_cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        Ok(cancel(inner.job_mut(id)?, now))
    }

    async fn cancel_requested_at(
        &self,
        id: JobId,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let inner = self.lock()?;
        inner
            .jobs
            .get(&id)
            .map(|e| e.job.cancel_requested_at)
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn request_cancel_for_project(
        &self,
        project_id: &ProjectId,
        except: Option<JobId>,
    ) -> Result<ProjectCancelSummary, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        let mut summary = ProjectCancelSummary::default();
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.project_id.as_ref() != Some(project_id) || Some(job.id) == except {
                continue;
            }
            match cancel(job, now) {
                CancelOutcome::Cancelled => summary.cancelled += 1,
                CancelOutcome::Requested => summary.requested += 1,
                CancelOutcome::AlreadyTerminal(_) => {}
            }
        }
        Ok(summary)
    }

    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        let source = inner.job_mut(id)?;
        if !source.is_terminal() {
            return Err(JobStoreError::Conflict(format!(
                "job {id} is {}; only terminal jobs can be retried",
                source.state
            )));
        }
        let job = Job {
            id: JobId::new(),
            state: JobState::Queued,
            attempts: 0,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested_at: None,
            available_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            ..source.clone()
        };
        inner.insert(job.clone());
        Ok(job)
    }

    async fn force_unlock(&self, id: JobId) -> Result<bool, JobStoreError> {
        let now = self.now();
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        if job.state != JobState::Running {
            return Ok(false);
        }
        requeue(job, now, now);
        Ok(true)
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        if !job.is_terminal() {
            return Err(JobStoreError::Conflict(format!(
                "job {id} is {}; only terminal jobs can be deleted",
                job.state
            )));
        }
        inner.jobs.remove(&id);
        Ok(())
    }

    async fn delete_by_state(&self, state: JobState) -> Result<u64, JobStoreError> {
        require_terminal_state(state)?;
        let mut inner = self.lock()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, e| e.job.state != state);
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn settings(&self) -> Result<QueueSettings, JobStoreError> {
        Ok(self.lock()?.settings)
    }

    async fn set_paused(&self, paused: bool) -> Result<QueueSettings, JobStoreError> {
        let mut inner = self.lock()?;
        inner.settings.paused = paused;
        Ok(inner.settings)
    }

    async fn set_concurrency(&self, concurrency: u32) -> Result<QueueSettings, JobStoreError> {
        let concurrency = QueueSettings::check_concurrency(concurrency)?;
        let mut inner = self.lock()?;
        inner.settings.concurrency = concurrency;
        Ok(inner.settings)
    }
}
