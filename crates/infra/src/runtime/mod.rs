//! Container lifecycle boundary.
//!
//! Every project runs as a compose project group. Operations are idempotent:
//! `up` on a running group converges it, `down` on a missing group succeeds.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::HandlerError;

pub mod compose;
pub mod in_memory;

pub use compose::ComposeCli;
pub use in_memory::InMemoryRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0} not found in PATH")]
    NotInstalled(String),
    #[error("{cmd} {} failed: {stderr}", .args.join(" "))]
    CommandFailed {
        cmd: String,
        args: Vec<String>,
        stderr: String,
    },
    #[error("unexpected runtime output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for HandlerError {
    fn from(err: RuntimeError) -> Self {
        HandlerError::transient(err.to_string())
    }
}

/// Lifecycle state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl ContainerState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "removing" => Self::Removing,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    /// `None` for containers without a health check.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub service: String,
    pub state: ContainerState,
    pub health: Option<HealthState>,
}

impl ContainerStatus {
    pub fn running(service: impl Into<String>, project: &str) -> Self {
        let service = service.into();
        Self {
            name: format!("{project}-{service}-1"),
            service,
            state: ContainerState::Running,
            health: Some(HealthState::Healthy),
        }
    }

    pub fn with_health(mut self, health: Option<HealthState>) -> Self {
        self.health = health;
        self
    }

    pub fn with_state(mut self, state: ContainerState) -> Self {
        self.state = state;
        self
    }
}

/// Aggregate readiness of a container group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    Failed(String),
}

/// Ready when every container runs and every health check passes.
pub fn readiness(containers: &[ContainerStatus]) -> Readiness {
    if containers.is_empty() {
        return Readiness::Pending;
    }

    for c in containers {
        match (c.state, c.health) {
            (_, Some(HealthState::Unhealthy)) => {
                return Readiness::Failed(format!("container {} is unhealthy", c.name));
            }
            (ContainerState::Exited | ContainerState::Dead, _) => {
                return Readiness::Failed(format!("container {} has stopped", c.name));
            }
            _ => {}
        }
    }

    let ready = containers.iter().all(|c| {
        c.state == ContainerState::Running
            && matches!(c.health, None | Some(HealthState::Healthy))
    });
    if ready {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

/// Container runtime contract.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create or converge the group described by `dir`. With
    /// `preserve_others = false` containers not in the definition are removed.
    async fn up(&self, project: &str, dir: &Path, preserve_others: bool)
    -> Result<(), RuntimeError>;

    /// Stop and remove the group, keeping named volumes.
    async fn down(&self, project: &str, dir: &Path) -> Result<(), RuntimeError>;

    /// Stop and remove the group together with its volumes.
    async fn down_with_volumes(&self, project: &str, dir: &Path) -> Result<(), RuntimeError>;

    /// Build the images of the group.
    async fn build(&self, project: &str, dir: &Path) -> Result<(), RuntimeError>;

    async fn status(&self, project: &str, dir: &Path)
    -> Result<Vec<ContainerStatus>, RuntimeError>;

    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;
}
