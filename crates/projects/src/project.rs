use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sandcastle_core::{DomainError, DomainResult, ProjectId, UserId};

/// Project lifecycle status, as driven by the bootstrap pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Workspace files are being written.
    Provisioning,
    /// Container group is starting / waiting for health.
    Starting,
    /// Containers are healthy; agent session being created.
    AgentStarting,
    /// Agent is processing a prompt.
    Working,
    /// Agent finished its last prompt.
    Idle,
    /// Containers stopped.
    Stopped,
    /// A pipeline step failed terminally.
    Error,
    /// Teardown in progress; only deletion may follow.
    Deleting,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Provisioning => "provisioning",
            ProjectStatus::Starting => "starting",
            ProjectStatus::AgentStarting => "agent_starting",
            ProjectStatus::Working => "working",
            ProjectStatus::Idle => "idle",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Error => "error",
            ProjectStatus::Deleting => "deleting",
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// `Deleting` is sticky: a project being torn down never comes back to
    /// life because a late pipeline job finished.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        match self {
            ProjectStatus::Deleting => next == ProjectStatus::Deleting,
            _ => true,
        }
    }
}

impl core::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProjectStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "provisioning" => ProjectStatus::Provisioning,
            "starting" => ProjectStatus::Starting,
            "agent_starting" => ProjectStatus::AgentStarting,
            "working" => ProjectStatus::Working,
            "idle" => ProjectStatus::Idle,
            "stopped" => ProjectStatus::Stopped,
            "error" => ProjectStatus::Error,
            "deleting" => ProjectStatus::Deleting,
            other => {
                return Err(DomainError::validation(format!(
                    "unknown project status: {other}"
                )));
            }
        })
    }
}

/// Status of a production deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Building,
    Starting,
    Running,
    Stopped,
    Failed,
}

/// A production variant of a project, identified by the content hash of the
/// app sources it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionDeployment {
    pub hash: String,
    pub port: u16,
    pub status: ProductionStatus,
    pub url: Option<String>,
    pub last_error: Option<String>,
}

impl ProductionDeployment {
    pub fn building(hash: impl Into<String>, port: u16) -> Self {
        Self {
            hash: hash.into(),
            port,
            status: ProductionStatus::Building,
            url: None,
            last_error: None,
        }
    }
}

/// A user project: one sandbox with its container group, workspace and agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner: UserId,
    pub name: String,
    pub prompt: String,
    pub model: String,
    pub images: Vec<String>,
    pub status: ProjectStatus,
    pub session_id: Option<String>,
    pub last_error: Option<String>,
    pub production: Option<ProductionDeployment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project in `Provisioning`.
    pub fn new(
        id: ProjectId,
        owner: UserId,
        name: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        images: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            name: name.into(),
            prompt: prompt.into(),
            model: model.into(),
            images,
            status: ProjectStatus::Provisioning,
            session_id: None,
            last_error: None,
            production: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, recording `error` when entering `Error`.
    pub fn transition(&mut self, next: ProjectStatus, error: Option<String>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::conflict(format!(
                "project {} is {}; cannot move to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.last_error = if next == ProjectStatus::Error { error } else { None };
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_deleting(&self) -> bool {
        self.status == ProjectStatus::Deleting
    }
}
