//! Worker loop: claim, run, settle.
//!
//! One executor owns one worker id. Each iteration it recovers expired leases,
//! reads the live queue settings, claims jobs up to the configured concurrency
//! and runs every job in its own task. Results are written back only while the
//! executor still owns the lease.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use sandcastle_core::JobId;

use super::handler::{HandlerError, HandlerRegistry, JobContext, JobOutcome};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Lease owner written on claimed jobs; unique per executor.
    pub worker_id: String,
    /// How long to sleep when there is nothing to claim.
    pub poll_interval: Duration,
    /// Lease duration granted on claim and on every heartbeat.
    pub lease: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".to_string(),
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_rescheduled: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_discarded: u64,
    pub jobs_recovered: u64,
    pub current_running: usize,
}

/// The transition an execution asked the store for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Succeeded,
    Rescheduled { delay: Duration },
    Retried { attempts: u32, delay: Duration },
    Failed { attempts: u32 },
    Cancelled,
    /// The lease was gone; the result was thrown away.
    Discarded,
}

struct Shared {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

/// Background job executor.
#[derive(Clone)]
pub struct JobExecutor {
    shared: Arc<Shared>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: JobExecutorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                config,
                stats: Arc::new(Mutex::new(ExecutorStats::default())),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn stats(&self) -> ExecutorStats {
        self.shared.stats().clone()
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.shared.stats.clone();
        let worker_id = self.shared.config.worker_id.clone();
        let join = tokio::spawn(executor_loop(self.shared, shutdown_rx));

        JobExecutorHandle {
            worker_id,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Recover, claim and run at most one job inline.
    ///
    /// Ignores the pause flag and the concurrency limit. `None` when nothing
    /// was eligible.
    pub async fn run_next(&self) -> Result<Option<Settled>, JobStoreError> {
        self.shared.recover().await?;
        let config = &self.shared.config;
        match self.shared.store.claim_next(&config.worker_id, config.lease).await? {
            Some(job) => Ok(Some(self.shared.clone().process(job).await)),
            None => Ok(None),
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    worker_id: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop claiming, drain in-flight jobs and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(worker_id = %self.worker_id, error = %e, "job executor task failed");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type InFlight = Arc<Mutex<HashSet<JobId>>>;

async fn executor_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let worker_id = shared.config.worker_id.clone();
    info!(worker_id = %worker_id, "job executor started");

    let mut tasks = JoinSet::new();
    let in_flight: InFlight = Arc::default();

    loop {
        while tasks.try_join_next().is_some() {}
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = shared.fill(&mut tasks, &in_flight).await {
            error!(worker_id = %worker_id, error = %e, "job store unavailable");
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    shared.drain(tasks, &in_flight).await;
    info!(worker_id = %worker_id, "job executor stopped");
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn recover(&self) -> Result<(), JobStoreError> {
        let recovered = self.store.recover_expired().await?;
        if recovered > 0 {
            warn!(
                worker_id = %self.config.worker_id,
                recovered,
                "recovered jobs with expired leases"
            );
            self.stats().jobs_recovered += recovered;
        }
        Ok(())
    }

    /// Claim jobs until the live concurrency limit is reached.
    async fn fill(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        in_flight: &InFlight,
    ) -> Result<(), JobStoreError> {
        self.recover().await?;

        let settings = self.store.settings().await?;
        if settings.paused {
            debug!(worker_id = %self.config.worker_id, "queue paused");
            return Ok(());
        }

        while tasks.len() < settings.concurrency as usize {
            let Some(job) = self
                .store
                .claim_next(&self.config.worker_id, self.config.lease)
                .await?
            else {
                break;
            };

            let id = job.id;
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id);

            let shared = self.clone();
            let in_flight = in_flight.clone();
            tasks.spawn(async move {
                shared.process(job).await;
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            });
        }
        Ok(())
    }

    async fn drain(&self, mut tasks: JoinSet<()>, in_flight: &InFlight) {
        let worker_id = &self.config.worker_id;
        if !tasks.is_empty() {
            info!(
                worker_id = %worker_id,
                running = tasks.len(),
                "waiting for in-flight jobs"
            );
        }

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                worker_id = %worker_id,
                running = tasks.len(),
                "shutdown grace period elapsed; aborting in-flight jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let leftover: Vec<JobId> = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for id in leftover {
            match self.store.release(id, worker_id).await {
                Ok(true) => info!(worker_id = %worker_id, job_id = %id, "released job lease"),
                Ok(false) => debug!(worker_id = %worker_id, job_id = %id, "lease already gone"),
                Err(e) => {
                    warn!(worker_id = %worker_id, job_id = %id, error = %e, "failed to release job")
                }
            }
        }
    }

    async fn process(self: Arc<Self>, job: Job) -> Settled {
        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id = %self.config.worker_id,
            attempt = job.attempts + 1,
        );

        async move {
            self.stats().current_running += 1;
            let started = Instant::now();
            debug!("job started");

            let result = self.execute(job.clone()).await;
            let settled = match self.settle(&job, result).await {
                Ok(settled) => settled,
                Err(e) => {
                    // The lease expires and recovery requeues the job.
                    error!(error = %e, "failed to record job result");
                    Settled::Discarded
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(elapsed_ms, outcome = ?settled, "job finished");
            self.record(&settled);
            settled
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: Job) -> Result<JobOutcome, HandlerError> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        let id = job.id;
        let ctx = JobContext::new(
            job,
            self.config.worker_id.clone(),
            self.config.lease,
            self.store.clone(),
        );
        let mut task = AbortOnDrop(tokio::spawn(
            async move { handler.run(&ctx).await }.in_current_span(),
        ));

        // Keep the lease while the handler runs; losing it drops the task.
        let mut renew = tokio::time::interval(renewal_period(self.config.lease));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                joined = &mut task.0 => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            Err(HandlerError::Panicked(panic_message(e.into_panic())))
                        }
                        Err(e) => Err(HandlerError::transient(format!("handler task aborted: {e}"))),
                    };
                }
                _ = renew.tick() => {
                    match self
                        .store
                        .heartbeat(id, &self.config.worker_id, self.config.lease)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("lease lost while running; stopping handler");
                            return Err(HandlerError::LeaseLost);
                        }
                        Err(e) => warn!(error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }

    async fn settle(
        &self,
        job: &Job,
        result: Result<JobOutcome, HandlerError>,
    ) -> Result<Settled, JobStoreError> {
        let store = &self.store;
        let worker_id = self.config.worker_id.as_str();

        let error = match result {
            Ok(JobOutcome::Success) => {
                let written = store.complete(job.id, worker_id).await?;
                return Ok(written_or_discarded(written, Settled::Succeeded));
            }
            Ok(JobOutcome::Reschedule(delay)) => {
                let written = store.reschedule(job.id, worker_id, delay).await?;
                return Ok(written_or_discarded(written, Settled::Rescheduled { delay }));
            }
            Ok(JobOutcome::Cancelled) => {
                let written = store.mark_cancelled(job.id, worker_id).await?;
                return Ok(written_or_discarded(written, Settled::Cancelled));
            }
            Ok(JobOutcome::Failure(err)) | Err(err) => err,
        };

        if matches!(error, HandlerError::LeaseLost) {
            warn!("lease lost during execution; discarding job result");
            return Ok(Settled::Discarded);
        }

        let message = error.to_string();
        if error.is_permanent() {
            error!(error = %message, "job failed permanently");
            let written = store.fail(job.id, worker_id, job.attempts, &message).await?;
            return Ok(written_or_discarded(
                written,
                Settled::Failed {
                    attempts: job.attempts,
                },
            ));
        }

        match self.config.retry.decide(job.attempts, job.max_attempts) {
            RetryDecision::Retry { attempts, delay } => {
                warn!(
                    error = %message,
                    attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "job failed; retry scheduled"
                );
                let written = store
                    .schedule_retry(job.id, worker_id, attempts, delay, &message)
                    .await?;
                Ok(written_or_discarded(written, Settled::Retried { attempts, delay }))
            }
            RetryDecision::Exhausted { attempts } => {
                error!(error = %message, attempts, "job failed; retries exhausted");
                let written = store.fail(job.id, worker_id, attempts, &message).await?;
                Ok(written_or_discarded(written, Settled::Failed { attempts }))
            }
        }
    }

    fn record(&self, settled: &Settled) {
        let mut stats = self.stats();
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.jobs_processed += 1;
        match settled {
            Settled::Succeeded => stats.jobs_succeeded += 1,
            Settled::Rescheduled { .. } => stats.jobs_rescheduled += 1,
            Settled::Retried { .. } => stats.jobs_retried += 1,
            Settled::Failed { .. } => stats.jobs_failed += 1,
            Settled::Cancelled => stats.jobs_cancelled += 1,
            Settled::Discarded => stats.jobs_discarded += 1,
        }
    }
}

fn written_or_discarded(written: bool, settled: Settled) -> Settled {
    if written {
        match &settled {
            Settled::Succeeded => info!("job succeeded"),
            Settled::Cancelled => info!("job cancelled"),
            _ => {}
        }
        settled
    } else {
        warn!(intended = ?settled, "lease lost; discarding job result");
        Settled::Discarded
    }
}

fn renewal_period(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(1))
}

/// Aborts the handler task if the executor task running it is aborted.
struct AbortOnDrop(JoinHandle<Result<JobOutcome, HandlerError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jobs::handler::JobHandler;
    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::jobs::types::{JobState, JobType, NewJob};

    struct Scripted<F>(F);

    #[async_trait]
    impl<F> JobHandler for Scripted<F>
    where
        F: Fn(&JobContext) -> Result<JobOutcome, HandlerError> + Send + Sync,
    {
        async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            (self.0)(ctx)
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            panic!("boom");
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl JobHandler for Sleeps {
        async fn run(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(JobOutcome::Success)
        }
    }

    /// Counts its runs and sleeps through each one.
    struct CountedSleeps {
        runs: Arc<AtomicU32>,
        duration: Duration,
    }

    #[async_trait]
    impl JobHandler for CountedSleeps {
        async fn run(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            Ok(JobOutcome::Success)
        }
    }

    fn config() -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_worker_id("w1")
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
    }

    fn executor(
        store: &Arc<InMemoryJobStore>,
        job_type: JobType,
        handler: impl JobHandler + 'static,
    ) -> JobExecutor {
        let mut registry = HandlerRegistry::new();
        registry.register(job_type, handler);
        JobExecutor::new(store.clone(), registry, config())
    }

    async fn enqueue(store: &InMemoryJobStore, job_type: JobType) -> JobId {
        store
            .enqueue(NewJob::new(job_type, json!({"projectId": "p1"})))
            .await
            .unwrap()
            .id
    }

    async fn state(store: &InMemoryJobStore, id: JobId) -> Job {
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_completes_the_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(|_: &JobContext| Ok(JobOutcome::Success)),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        assert_eq!(executor.run_next().await.unwrap(), Some(Settled::Succeeded));
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.lease_owner.is_none());
        assert_eq!(executor.run_next().await.unwrap(), None);
        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_after_max_attempts() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(|_: &JobContext| Err(HandlerError::transient("docker down"))),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        assert!(matches!(
            executor.run_next().await.unwrap(),
            Some(Settled::Retried { attempts: 1, .. })
        ));
        assert_eq!(state(&store, id).await.state, JobState::Queued);
        assert!(matches!(
            executor.run_next().await.unwrap(),
            Some(Settled::Retried { attempts: 2, .. })
        ));
        assert_eq!(
            executor.run_next().await.unwrap(),
            Some(Settled::Failed { attempts: 3 })
        );

        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("docker down"));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(|_: &JobContext| Err(HandlerError::permanent("project missing"))),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        assert_eq!(
            executor.run_next().await.unwrap(),
            Some(Settled::Failed { attempts: 0 })
        );
        assert_eq!(state(&store, id).await.state, JobState::Failed);
    }

    #[tokio::test]
    async fn unregistered_type_fails_permanently() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = JobExecutor::new(store.clone(), HandlerRegistry::new(), config());
        let id = enqueue(&store, JobType::DockerStop).await;

        executor.run_next().await.unwrap();
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.last_error.as_deref(),
            Some("no handler registered for job type docker.stop")
        );
    }

    #[tokio::test]
    async fn reschedule_does_not_count_an_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(|_: &JobContext| Ok(JobOutcome::Reschedule(Duration::from_secs(60)))),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        executor.run_next().await.unwrap();
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.available_at > job.created_at);
        assert_eq!(executor.run_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn panics_become_transient_failures() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(&store, JobType::DockerStop, Panics);
        let id = enqueue(&store, JobType::DockerStop).await;

        assert!(matches!(
            executor.run_next().await.unwrap(),
            Some(Settled::Retried { attempts: 1, .. })
        ));
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.last_error.as_deref(), Some("handler panicked: boom"));
    }

    /// Loses its lease to another worker before returning.
    struct Hijacked(Arc<InMemoryJobStore>);

    #[async_trait]
    impl JobHandler for Hijacked {
        async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            self.0.force_unlock(ctx.job_id()).await?;
            self.0.claim_next("w2", Duration::from_secs(60)).await?;
            Ok(JobOutcome::Success)
        }
    }

    #[tokio::test]
    async fn superseded_results_are_discarded() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(&store, JobType::DockerStop, Hijacked(store.clone()));
        let id = enqueue(&store, JobType::DockerStop).await;

        assert_eq!(executor.run_next().await.unwrap(), Some(Settled::Discarded));
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn cancelled_outcome_marks_job_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(|_: &JobContext| Ok(JobOutcome::Cancelled)),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        assert_eq!(executor.run_next().await.unwrap(), Some(Settled::Cancelled));
        assert_eq!(state(&store, id).await.state, JobState::Cancelled);
    }

    /// Gets cancelled mid-run, then fails.
    struct CancelledThenFails(Arc<InMemoryJobStore>);

    #[async_trait]
    impl JobHandler for CancelledThenFails {
        async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            self.0.request_cancel(ctx.job_id()).await?;
            Err(HandlerError::transient("interrupted"))
        }
    }

    #[tokio::test]
    async fn pending_cancel_turns_retry_into_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = executor(
            &store,
            JobType::DockerStop,
            CancelledThenFails(store.clone()),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        executor.run_next().await.unwrap();
        assert_eq!(state(&store, id).await.state, JobState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_executor_drains_the_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let executor = executor(
            &store,
            JobType::DockerStop,
            Scripted(move |_: &JobContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::Success)
            }),
        );

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(enqueue(&store, JobType::DockerStop).await);
        }

        let handle = executor.spawn();
        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give the last settle a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 10);
        for id in ids {
            assert_eq!(state(&store, id).await.state, JobState::Succeeded);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_is_renewed_while_a_slow_handler_runs() {
        let store = Arc::new(InMemoryJobStore::new());
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::ProductionBuild,
            CountedSleeps {
                runs: runs.clone(),
                duration: Duration::from_millis(400),
            },
        );
        let executor = JobExecutor::new(
            store.clone(),
            registry,
            config().with_lease(Duration::from_millis(100)),
        );
        let id = enqueue(&store, JobType::ProductionBuild).await;

        let handle = executor.spawn();
        tokio::time::sleep(Duration::from_millis(900)).await;
        handle.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 0);
    }

    /// Lets another worker take the job while it is still running.
    struct Stolen(Arc<InMemoryJobStore>);

    #[async_trait]
    impl JobHandler for Stolen {
        async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
            self.0.force_unlock(ctx.job_id()).await?;
            self.0.claim_next("w2", Duration::from_secs(60)).await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(JobOutcome::Success)
        }
    }

    #[tokio::test]
    async fn losing_the_lease_stops_the_handler() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::DockerStop, Stolen(store.clone()));
        let executor = JobExecutor::new(
            store.clone(),
            registry,
            config().with_lease(Duration::from_millis(30)),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        let settled = tokio::time::timeout(Duration::from_secs(5), executor.run_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled, Some(Settled::Discarded));
        assert_eq!(state(&store, id).await.lease_owner.as_deref(), Some("w2"));
    }

    #[test]
    fn renewal_runs_three_times_per_lease() {
        assert_eq!(renewal_period(Duration::from_secs(300)), Duration::from_secs(100));
        assert_eq!(renewal_period(Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn paused_queue_is_not_claimed() {
        let store = Arc::new(InMemoryJobStore::new());
        store.set_paused(true).await.unwrap();
        let executor = executor(&store, JobType::DockerStop, Sleeps(Duration::ZERO));
        let id = enqueue(&store, JobType::DockerStop).await;

        let handle = executor.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(state(&store, id).await.state, JobState::Queued);
    }

    #[tokio::test]
    async fn shutdown_releases_jobs_still_running() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::DockerStop, Sleeps(Duration::from_secs(3600)));
        let executor = JobExecutor::new(
            store.clone(),
            registry,
            config().with_shutdown_grace(Duration::from_millis(20)),
        );
        let id = enqueue(&store, JobType::DockerStop).await;

        let handle = executor.spawn();
        for _ in 0..100 {
            if state(&store, id).await.state == JobState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        let job = state(&store, id).await;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.lease_owner.is_none());
    }
}
