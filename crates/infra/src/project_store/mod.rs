//! Project records.

use async_trait::async_trait;

use sandcastle_core::{DomainError, ProjectId, UserId};
use sandcastle_projects::{ProductionDeployment, Project, ProjectStatus};

use crate::jobs::HandlerError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryProjectStore;
pub use postgres::PostgresProjectStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectStoreError {
    #[error("project not found: {0}")]
    NotFound(ProjectId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for ProjectStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => ProjectStoreError::Conflict(msg),
            other => ProjectStoreError::Storage(other.to_string()),
        }
    }
}

impl From<ProjectStoreError> for HandlerError {
    fn from(err: ProjectStoreError) -> Self {
        match err {
            ProjectStoreError::Storage(_) => HandlerError::transient(err.to_string()),
            _ => HandlerError::permanent(err.to_string()),
        }
    }
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert or replace the whole record.
    async fn upsert(&self, project: &Project) -> Result<(), ProjectStoreError>;

    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, ProjectStoreError>;

    /// Projects of `owner`, oldest first.
    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Project>, ProjectStoreError>;

    /// Apply a status transition. `Conflict` once the project is deleting.
    async fn set_status(
        &self,
        id: &ProjectId,
        status: ProjectStatus,
        error: Option<String>,
    ) -> Result<Project, ProjectStoreError>;

    async fn set_session(
        &self,
        id: &ProjectId,
        session_id: Option<String>,
    ) -> Result<Project, ProjectStoreError>;

    async fn set_production(
        &self,
        id: &ProjectId,
        production: Option<ProductionDeployment>,
    ) -> Result<Project, ProjectStoreError>;

    /// Remove the record. `false` if there was none.
    async fn delete(&self, id: &ProjectId) -> Result<bool, ProjectStoreError>;
}
