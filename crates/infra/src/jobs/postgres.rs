//! Postgres-backed job store.
//!
//! All timestamps that take part in lease and availability checks come from
//! the database clock (`now()`), so any number of worker processes agree on
//! when a lease expired.
//!
//! ## Claim
//!
//! `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING`. Concurrent claimers skip rows another transaction is
//! claiming, so a job is handed to at most one worker.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `InvalidArgument` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use sandcastle_core::{JobId, ProjectId};

use super::store::{require_terminal_state, JobStore, JobStoreError};
use super::types::{
    CancelOutcome, Job, JobFilter, JobState, JobStats, NewJob, ProjectCancelSummary, QueueSettings,
};

/// Schema statements, executed in order by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        project_id TEXT,
        state TEXT NOT NULL
            CHECK (state IN ('queued', 'running', 'succeeded', 'failed', 'cancelled')),
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
        lease_owner TEXT,
        lease_expires_at TIMESTAMPTZ,
        cancel_requested_at TIMESTAMPTZ,
        available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CHECK (attempts <= max_attempts),
        CHECK ((state = 'running') = (lease_owner IS NOT NULL)),
        CHECK ((state = 'running') = (lease_expires_at IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (available_at, created_at) WHERE state = 'queued'",
    "CREATE INDEX IF NOT EXISTS jobs_lease_idx ON jobs (lease_expires_at) WHERE state = 'running'",
    "CREATE INDEX IF NOT EXISTS jobs_project_idx ON jobs (project_id)",
    "CREATE INDEX IF NOT EXISTS jobs_created_idx ON jobs (created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS queue_settings (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        paused BOOLEAN NOT NULL DEFAULT FALSE,
        concurrency INTEGER NOT NULL DEFAULT 4 CHECK (concurrency BETWEEN 1 AND 20)
    )
    "#,
    "INSERT INTO queue_settings (id) VALUES (1) ON CONFLICT (id) DO NOTHING",
];

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

const JOB_COLUMNS: &str = "id, job_type, payload, project_id, state, attempts, max_attempts, \
     lease_owner, lease_expires_at, cancel_requested_at, available_at, last_error, \
     created_at, updated_at";

/// Postgres-backed job store.
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch_job(
        &self,
        operation: &str,
        query: PgQuery<'_>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    /// Distinguish "missing" from "wrong state" after a conditional write hit no row.
    async fn explain_miss(&self, id: JobId, action: &str) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(job)) => JobStoreError::Conflict(format!(
                "job {id} is {}; only terminal jobs can be {action}",
                job.state
            )),
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(job_type = %new.job_type), err)]
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (id, job_type, payload, project_id, state, attempts, max_attempts, available_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, $5, COALESCE($6, now()))
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(*JobId::new().as_uuid())
            .bind(&new.job_type)
            .bind(&new.payload)
            .bind(new.project_id.as_ref().map(ProjectId::as_str))
            .bind(to_i32(new.max_attempts.max(1)))
            .bind(new.available_at);
        self.fetch_job("enqueue", query)
            .await?
            .ok_or_else(|| JobStoreError::Storage("insert returned no row".to_string()))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        self.fetch_job("get", sqlx::query(&sql).bind(*id.as_uuid()))
            .await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR state = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::text IS NULL OR project_id = $3)
                AND ($4::text IS NULL
                    OR id::text ILIKE $4
                    OR job_type ILIKE $4
                    OR COALESCE(project_id, '') ILIKE $4
                    OR COALESCE(last_error, '') ILIKE $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.job_type.as_deref())
            .bind(filter.project_id.as_ref().map(ProjectId::as_str))
            .bind(filter.search.as_deref().map(like_pattern))
            .bind(filter.effective_limit() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode_job).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            stats.record(state.parse()?, total.max(0) as usize);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'running',
                lease_owner = $1,
                lease_expires_at = now() + $2::bigint * interval '1 millisecond',
                updated_at = now()
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE state = 'queued' AND available_at <= now()
                ORDER BY available_at ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            "claim_next",
            sqlx::query(&sql).bind(worker_id).bind(millis(lease)),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = now() + $3::bigint * interval '1 millisecond',
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .bind(millis(lease))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn recover_expired(&self) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested_at IS NULL THEN 'queued' ELSE 'cancelled' END,
                available_at = CASE WHEN cancel_requested_at IS NULL THEN now() ELSE available_at END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE state = 'running' AND lease_expires_at < now()
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_expired", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'succeeded', lease_owner = NULL, lease_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        delay: Duration,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested_at IS NULL THEN 'queued' ELSE 'cancelled' END,
                available_at = now() + $3::bigint * interval '1 millisecond',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .bind(millis(delay))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn schedule_retry(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested_at IS NULL THEN 'queued' ELSE 'cancelled' END,
                attempts = LEAST($3, max_attempts),
                available_at = now() + $4::bigint * interval '1 millisecond',
                last_error = $5,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .bind(to_i32(attempts))
        .bind(millis(delay))
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed',
                attempts = LEAST($3, max_attempts),
                last_error = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .bind(to_i32(attempts))
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled',
                cancel_requested_at = COALESCE(cancel_requested_at, now()),
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_cancelled", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested_at IS NULL THEN 'queued' ELSE 'cancelled' END,
                available_at = now(),
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(worker_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn request_cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("request_cancel", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        let state: JobState = row
            .try_get::<String, _>("state")
            .map_err(decode_error)?
            .parse()?;

        let outcome = match state {
            JobState::Queued => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'cancelled', cancel_requested_at = now(), updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(*id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("request_cancel", e))?;
                CancelOutcome::Cancelled
            }
            JobState::Running => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET cancel_requested_at = COALESCE(cancel_requested_at, now()), updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(*id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("request_cancel", e))?;
                CancelOutcome::Requested
            }
            terminal => CancelOutcome::AlreadyTerminal(terminal),
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn cancel_requested_at(
        &self,
        id: JobId,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let row = sqlx::query("SELECT cancel_requested_at FROM jobs WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel_requested_at", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        row.try_get("cancel_requested_at").map_err(decode_error)
    }

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    async fn request_cancel_for_project(
        &self,
        project_id: &ProjectId,
        except: Option<JobId>,
    ) -> Result<ProjectCancelSummary, JobStoreError> {
        let except = except.map(|id| *id.as_uuid());
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Queued first: a job claimed in between is caught by the running pass.
        let cancelled = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled', cancel_requested_at = now(), updated_at = now()
            WHERE project_id = $1 AND state = 'queued' AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(project_id.as_str())
        .bind(except)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("request_cancel_for_project", e))?
        .rows_affected();

        let requested = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested_at = COALESCE(cancel_requested_at, now()), updated_at = now()
            WHERE project_id = $1 AND state = 'running' AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(project_id.as_str())
        .bind(except)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("request_cancel_for_project", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(ProjectCancelSummary {
            cancelled: cancelled as usize,
            requested: requested as usize,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (id, job_type, payload, project_id, state, attempts, max_attempts, available_at)
            SELECT $2, job_type, payload, project_id, 'queued', 0, max_attempts, now()
            FROM jobs
            WHERE id = $1 AND state IN ('succeeded', 'failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(*JobId::new().as_uuid());
        match self.fetch_job("retry", query).await? {
            Some(job) => Ok(job),
            None => Err(self.explain_miss(id, "retried").await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn force_unlock(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested_at IS NULL THEN 'queued' ELSE 'cancelled' END,
                available_at = CASE WHEN cancel_requested_at IS NULL THEN now() ELSE available_at END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(*id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("force_unlock", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id = $1 AND state IN ('succeeded', 'failed', 'cancelled')",
        )
        .bind(*id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.explain_miss(id, "deleted").await)
        }
    }

    #[instrument(skip(self), err)]
    async fn delete_by_state(&self, state: JobState) -> Result<u64, JobStoreError> {
        require_terminal_state(state)?;
        let result = sqlx::query("DELETE FROM jobs WHERE state = $1")
            .bind(state.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_by_state", e))?;
        Ok(result.rows_affected())
    }

    async fn settings(&self) -> Result<QueueSettings, JobStoreError> {
        let row = sqlx::query("SELECT paused, concurrency FROM queue_settings WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("settings", e))?;
        match row {
            Some(row) => decode_settings(&row),
            None => Ok(QueueSettings::default()),
        }
    }

    #[instrument(skip(self), err)]
    async fn set_paused(&self, paused: bool) -> Result<QueueSettings, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_settings (id, paused) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET paused = EXCLUDED.paused
            RETURNING paused, concurrency
            "#,
        )
        .bind(paused)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_paused", e))?;
        decode_settings(&row)
    }

    #[instrument(skip(self), err)]
    async fn set_concurrency(&self, concurrency: u32) -> Result<QueueSettings, JobStoreError> {
        let concurrency = QueueSettings::check_concurrency(concurrency)?;
        let row = sqlx::query(
            r#"
            INSERT INTO queue_settings (id, concurrency) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET concurrency = EXCLUDED.concurrency
            RETURNING paused, concurrency
            "#,
        )
        .bind(to_i32(concurrency))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_concurrency", e))?;
        decode_settings(&row)
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    project_id: Option<String>,
    state: String,
    attempts: i32,
    max_attempts: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    cancel_requested_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            project_id: row.try_get("project_id")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            cancel_requested_at: row.try_get("cancel_requested_at")?,
            available_at: row.try_get("available_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let project_id = row
            .project_id
            .map(ProjectId::parse)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {}: {e}", row.id)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            project_id,
            state: row.state.parse()?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            cancel_requested_at: row.cancel_requested_at,
            available_at: row.available_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_settings(row: &PgRow) -> Result<QueueSettings, JobStoreError> {
    let paused: bool = row.try_get("paused").map_err(decode_error)?;
    let concurrency: i32 = row.try_get("concurrency").map_err(decode_error)?;
    Ok(QueueSettings {
        paused,
        concurrency: concurrency.max(1) as u32,
    })
}

fn decode_error(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {e}"))
}

/// Milliseconds for interval arithmetic, capped at a century.
fn millis(d: Duration) -> i64 {
    const CAP_MS: u128 = 100 * 365 * 24 * 60 * 60 * 1000;
    d.as_millis().min(CAP_MS) as i64
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// `%needle%` with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some("23514") => JobStoreError::InvalidArgument(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
