//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sandcastle_core::{JobId, ProjectId};

use super::store::JobStoreError;

/// Default number of executions a job gets before it fails terminally.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounds for the live-tunable per-worker concurrency.
pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 20;

/// Every job type this system knows how to run.
///
/// Rows store the wire name as text, so a row written by a newer binary still
/// loads and then fails with "no handler" instead of breaking listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "project.create")]
    ProjectCreate,
    #[serde(rename = "docker.composeUp")]
    DockerComposeUp,
    #[serde(rename = "docker.waitReady")]
    DockerWaitReady,
    #[serde(rename = "opencode.sessionCreate")]
    OpencodeSessionCreate,
    #[serde(rename = "opencode.sendInitialPrompt")]
    OpencodeSendInitialPrompt,
    #[serde(rename = "opencode.sendUserPrompt")]
    OpencodeSendUserPrompt,
    #[serde(rename = "production.build")]
    ProductionBuild,
    #[serde(rename = "production.start")]
    ProductionStart,
    #[serde(rename = "production.waitReady")]
    ProductionWaitReady,
    #[serde(rename = "production.stop")]
    ProductionStop,
    #[serde(rename = "docker.stop")]
    DockerStop,
    #[serde(rename = "project.delete")]
    ProjectDelete,
    #[serde(rename = "projects.deleteAllForUser")]
    ProjectsDeleteAllForUser,
}

impl JobType {
    pub const ALL: [JobType; 13] = [
        JobType::ProjectCreate,
        JobType::DockerComposeUp,
        JobType::DockerWaitReady,
        JobType::OpencodeSessionCreate,
        JobType::OpencodeSendInitialPrompt,
        JobType::OpencodeSendUserPrompt,
        JobType::ProductionBuild,
        JobType::ProductionStart,
        JobType::ProductionWaitReady,
        JobType::ProductionStop,
        JobType::DockerStop,
        JobType::ProjectDelete,
        JobType::ProjectsDeleteAllForUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ProjectCreate => "project.create",
            JobType::DockerComposeUp => "docker.composeUp",
            JobType::DockerWaitReady => "docker.waitReady",
            JobType::OpencodeSessionCreate => "opencode.sessionCreate",
            JobType::OpencodeSendInitialPrompt => "opencode.sendInitialPrompt",
            JobType::OpencodeSendUserPrompt => "opencode.sendUserPrompt",
            JobType::ProductionBuild => "production.build",
            JobType::ProductionStart => "production.start",
            JobType::ProductionWaitReady => "production.waitReady",
            JobType::ProductionStop => "production.stop",
            JobType::DockerStop => "docker.stop",
            JobType::ProjectDelete => "project.delete",
            JobType::ProjectsDeleteAllForUser => "projects.deleteAllForUser",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobType {
    type Err = JobStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobStoreError::InvalidArgument(format!("unknown job type: {s}")))
    }
}

/// Job state. `Succeeded`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = JobStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            other => {
                return Err(JobStoreError::InvalidArgument(format!(
                    "unknown job state: {other}"
                )));
            }
        })
    }
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Wire name of the job type (see [`JobType::as_str`]).
    pub job_type: String,
    /// Immutable after enqueue.
    pub payload: serde_json::Value,
    pub project_id: Option<ProjectId>,
    pub state: JobState,
    /// Number of retries scheduled so far (the first run is not counted).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set iff `state == Running`.
    pub lease_owner: Option<String>,
    /// Set iff `state == Running`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// A queued job is not claimed before this instant.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Typed job type, `None` when this binary does not know the type.
    pub fn kind(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Running && self.lease_owner.as_deref() == Some(worker_id)
    }
}

/// A job to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub project_id: Option<ProjectId>,
    pub max_attempts: u32,
    /// Defaults to "now" at insert time.
    pub available_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.as_str().to_string(),
            payload,
            project_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: None,
        }
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// Filter for listing jobs. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub project_id: Option<ProjectId>,
    /// Case-insensitive substring over id, type, project id and last error.
    pub search: Option<String>,
    pub limit: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 500;

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type.as_str().to_string());
        self
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Limit clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.state.is_some_and(|s| s != job.state) {
            return false;
        }
        if self.job_type.as_deref().is_some_and(|t| t != job.job_type) {
            return false;
        }
        if self
            .project_id
            .as_ref()
            .is_some_and(|p| job.project_id.as_ref() != Some(p))
        {
            return false;
        }
        match self.search.as_deref().map(str::to_lowercase) {
            None => true,
            Some(needle) => {
                let hit = |s: &str| s.to_lowercase().contains(&needle);
                hit(&job.id.to_string())
                    || hit(&job.job_type)
                    || job.project_id.as_ref().is_some_and(|p| hit(p.as_str()))
                    || job.last_error.as_deref().is_some_and(hit)
            }
        }
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            job_type: None,
            project_id: None,
            search: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Running => self.running += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::Failed => self.failed += count,
            JobState::Cancelled => self.cancelled += count,
        }
    }
}

/// Process-wide queue controls, read by every worker loop on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub paused: bool,
    pub concurrency: u32,
}

impl QueueSettings {
    pub fn check_concurrency(concurrency: u32) -> Result<u32, JobStoreError> {
        if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            Ok(concurrency)
        } else {
            Err(JobStoreError::InvalidArgument(format!(
                "concurrency must be in {MIN_CONCURRENCY}..={MAX_CONCURRENCY}, got {concurrency}"
            )))
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            paused: false,
            concurrency: 4,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "state")]
pub enum CancelOutcome {
    /// The job was queued and is now `cancelled`.
    Cancelled,
    /// The job is running; `cancel_requested_at` is set and the handler is
    /// expected to stop at its next check.
    Requested,
    /// The job had already finished; nothing changed.
    AlreadyTerminal(JobState),
}

/// Counts from a project-wide cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectCancelSummary {
    pub cancelled: usize,
    pub requested: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_wire_names_round_trip() {
        for t in JobType::ALL {
            let parsed: JobType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
            assert_eq!(
                serde_json::to_value(t).unwrap(),
                serde_json::Value::String(t.as_str().to_string())
            );
        }
        assert!("docker.compose_up".parse::<JobType>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn concurrency_bounds() {
        assert!(QueueSettings::check_concurrency(0).is_err());
        assert_eq!(QueueSettings::check_concurrency(1).unwrap(), 1);
        assert_eq!(QueueSettings::check_concurrency(20).unwrap(), 20);
        assert!(QueueSettings::check_concurrency(21).is_err());
    }

    #[test]
    fn filter_limit_is_clamped() {
        assert_eq!(JobFilter::default().limit(0).effective_limit(), 1);
        assert_eq!(
            JobFilter::default().limit(10_000).effective_limit(),
            JobFilter::MAX_LIMIT
        );
    }
}
