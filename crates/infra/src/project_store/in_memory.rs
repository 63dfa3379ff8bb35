use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use sandcastle_core::{ProjectId, UserId};
use sandcastle_projects::{ProductionDeployment, Project, ProjectStatus};

use super::{ProjectStore, ProjectStoreError};

#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: Mutex<HashMap<ProjectId, Project>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_project<T>(
        &self,
        id: &ProjectId,
        f: impl FnOnce(&mut Project) -> Result<T, ProjectStoreError>,
    ) -> Result<T, ProjectStoreError> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| ProjectStoreError::Storage("project store lock poisoned".into()))?;
        let project = projects
            .get_mut(id)
            .ok_or_else(|| ProjectStoreError::NotFound(id.clone()))?;
        f(project)
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn upsert(&self, project: &Project) -> Result<(), ProjectStoreError> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| ProjectStoreError::Storage("project store lock poisoned".into()))?;
        projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, ProjectStoreError> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| ProjectStoreError::Storage("project store lock poisoned".into()))?;
        Ok(projects.get(id).cloned())
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Project>, ProjectStoreError> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| ProjectStoreError::Storage("project store lock poisoned".into()))?;
        let mut owned: Vec<Project> = projects
            .values()
            .filter(|p| &p.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(owned)
    }

    async fn set_status(
        &self,
        id: &ProjectId,
        status: ProjectStatus,
        error: Option<String>,
    ) -> Result<Project, ProjectStoreError> {
        self.with_project(id, |p| {
            p.transition(status, error)?;
            Ok(p.clone())
        })
    }

    async fn set_session(
        &self,
        id: &ProjectId,
        session_id: Option<String>,
    ) -> Result<Project, ProjectStoreError> {
        self.with_project(id, |p| {
            p.session_id = session_id;
            p.updated_at = Utc::now();
            Ok(p.clone())
        })
    }

    async fn set_production(
        &self,
        id: &ProjectId,
        production: Option<ProductionDeployment>,
    ) -> Result<Project, ProjectStoreError> {
        self.with_project(id, |p| {
            p.production = production;
            p.updated_at = Utc::now();
            Ok(p.clone())
        })
    }

    async fn delete(&self, id: &ProjectId) -> Result<bool, ProjectStoreError> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| ProjectStoreError::Storage("project store lock poisoned".into()))?;
        Ok(projects.remove(id).is_some())
    }
}
