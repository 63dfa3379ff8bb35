//! Project creation and teardown.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use sandcastle_projects::{
    compose_project_name, production_project_name, volume_name, Project, ProjectStatus,
};

use crate::jobs::payload::{
    DockerComposeUp, ProjectCreate, ProjectDelete, ProjectsDeleteAllForUser,
};
use crate::jobs::{HandlerError, JobContext, JobHandler, JobOutcome};

use super::{cancelled_before_next_step, PipelineDeps};

/// `project.create`: record the project, write its workspace and hand over
/// to `docker.composeUp`.
pub struct ProjectCreateHandler {
    deps: Arc<PipelineDeps>,
}

impl ProjectCreateHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for ProjectCreateHandler {
    #[instrument(name = "project.create", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let payload: ProjectCreate = ctx.payload()?;
        let deps = &self.deps;

        // A re-run after a crash finds the record it wrote the first time.
        let project = match deps.projects.get(&payload.project_id).await? {
            Some(existing) if existing.is_deleting() => {
                info!(project_id = %existing.id, "project is being deleted; not creating");
                return Ok(JobOutcome::Success);
            }
            Some(existing) => existing,
            None => {
                let name = payload
                    .name
                    .clone()
                    .unwrap_or_else(|| payload.project_id.as_str().to_string());
                let project = Project::new(
                    payload.project_id.clone(),
                    payload.owner_user_id.clone(),
                    name,
                    payload.prompt.clone(),
                    payload.model.clone(),
                    payload.images.clone(),
                );
                deps.projects.upsert(&project).await?;
                project
            }
        };

        deps.workspace.prepare(&project).await?;
        deps.runtime
            .ensure_network(&deps.workspace.settings().network)
            .await?;
        deps.runtime.ensure_volume(&volume_name(&project.id)).await?;

        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        ctx.queue()
            .docker_compose_up(DockerComposeUp::new(project.id.clone()))
            .await?;
        info!(project_id = %project.id, "project provisioned");
        Ok(JobOutcome::Success)
    }
}

/// `project.delete`: stop everything the project owns and forget it.
/// Every step tolerates state that is already gone.
pub struct ProjectDeleteHandler {
    deps: Arc<PipelineDeps>,
}

impl ProjectDeleteHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for ProjectDeleteHandler {
    #[instrument(name = "project.delete", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let ProjectDelete { project_id } = ctx.payload()?;
        let deps = &self.deps;

        let summary = ctx.cancel_other_project_jobs(&project_id).await?;
        if summary.cancelled + summary.requested > 0 {
            info!(
                project_id = %project_id,
                cancelled = summary.cancelled,
                requested = summary.requested,
                "cancelled pending project jobs"
            );
        }

        if deps.projects.get(&project_id).await?.is_some() {
            deps.set_status(&project_id, ProjectStatus::Deleting, None)
                .await?;
        }

        let dir = deps.compose_dir(&project_id);
        deps.runtime
            .down_with_volumes(&compose_project_name(&project_id), &dir)
            .await?;
        for hash in deps.workspace.production_hashes(&project_id).await? {
            deps.runtime
                .down_with_volumes(
                    &production_project_name(&project_id, &hash),
                    &deps.workspace.production_dir(&project_id, &hash),
                )
                .await?;
        }

        deps.workspace.remove(&project_id).await?;
        if !deps.projects.delete(&project_id).await? {
            warn!(project_id = %project_id, "project record was already gone");
        }
        info!(project_id = %project_id, "project deleted");
        Ok(JobOutcome::Success)
    }
}

/// `projects.deleteAllForUser`: one `project.delete` per owned project.
pub struct DeleteAllForUserHandler {
    deps: Arc<PipelineDeps>,
}

impl DeleteAllForUserHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for DeleteAllForUserHandler {
    #[instrument(name = "projects.deleteAllForUser", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let ProjectsDeleteAllForUser { owner_user_id } = ctx.payload()?;

        let projects = self.deps.projects.list_by_owner(&owner_user_id).await?;
        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        let queue = ctx.queue();
        for project in &projects {
            queue
                .project_delete(ProjectDelete::new(project.id.clone()))
                .await?;
        }
        info!(owner = %owner_user_id, count = projects.len(), "project deletions enqueued");
        Ok(JobOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::DockerStop;
    use crate::jobs::{JobState, Settled};
    use crate::pipeline::testing::Harness;
    use crate::project_store::ProjectStore;
    use sandcastle_core::{ProjectId, UserId};

    fn create_payload(id: &str, owner: &str) -> ProjectCreate {
        ProjectCreate {
            project_id: ProjectId::parse(id).unwrap(),
            owner_user_id: UserId::parse(owner).unwrap(),
            name: Some("Demo".to_string()),
            prompt: "build a todo app".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            images: vec![],
        }
    }

    #[tokio::test]
    async fn create_provisions_and_chains_compose_up() {
        let h = Harness::new();
        h.queue.project_create(create_payload("p1", "u1")).await.unwrap();

        assert_eq!(h.run_next().await, Some(Settled::Succeeded));

        let id = ProjectId::parse("p1").unwrap();
        let project = h.projects.get(&id).await.unwrap().unwrap();
        assert_eq!(project.name, "Demo");
        assert_eq!(project.status, ProjectStatus::Provisioning);
        assert!(h.workspace.project_dir(&id).join("compose.yaml").exists());
        assert!(h.runtime.has_network("sandcastle-edge"));
        assert!(h.runtime.has_volume("sc-p1-workspace"));
        assert_eq!(h.job_types().await, vec!["project.create", "docker.composeUp"]);
    }

    #[tokio::test]
    async fn create_rerun_keeps_existing_record() {
        let h = Harness::new();
        let id = ProjectId::parse("p1").unwrap();
        let mut existing = Project::new(
            id.clone(),
            UserId::parse("u1").unwrap(),
            "Original",
            "build a todo app",
            "anthropic/claude-sonnet-4",
            vec![],
        );
        existing.session_id = Some("ses_1".to_string());
        h.projects.upsert(&existing).await.unwrap();

        h.queue.project_create(create_payload("p1", "u1")).await.unwrap();
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));

        let project = h.projects.get(&id).await.unwrap().unwrap();
        assert_eq!(project.name, "Original");
        assert_eq!(project.session_id.as_deref(), Some("ses_1"));
    }

    #[tokio::test]
    async fn delete_tears_everything_down_and_is_idempotent() {
        let h = Harness::new();
        h.queue.project_create(create_payload("p1", "u1")).await.unwrap();
        h.run_next().await;

        let id = ProjectId::parse("p1").unwrap();
        h.queue.project_delete(ProjectDelete::new(id.clone())).await.unwrap();

        // docker.composeUp runs first and chains a wait, which the delete cancels.
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
        assert!(h.runtime.is_up("sc-p1"));
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
        assert_eq!(h.run_next().await, None);

        assert!(!h.runtime.is_up("sc-p1"));
        assert!(!h.runtime.has_volume("sc-p1-workspace"));
        assert!(!h.workspace.project_dir(&id).exists());
        assert!(h.projects.get(&id).await.unwrap().is_none());
        let wait = h.latest(crate::jobs::JobType::DockerWaitReady).await;
        assert_eq!(wait.state, JobState::Cancelled);

        h.queue.project_delete(ProjectDelete::new(id)).await.unwrap();
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
    }

    #[tokio::test]
    async fn jobs_of_a_deleted_project_are_skipped() {
        let h = Harness::new();
        h.queue.project_create(create_payload("p1", "u1")).await.unwrap();
        h.run_next().await;

        let id = ProjectId::parse("p1").unwrap();
        h.projects
            .set_status(&id, ProjectStatus::Deleting, None)
            .await
            .unwrap();
        // Claims the queued composeUp, which must not bring anything up.
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
        assert!(!h.runtime.is_up("sc-p1"));

        h.queue.docker_stop(DockerStop::new(id)).await.unwrap();
        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
    }

    #[tokio::test]
    async fn delete_all_fans_out_per_owned_project() {
        let h = Harness::new();
        for (id, owner) in [("p1", "u1"), ("p2", "u1"), ("p3", "u2")] {
            h.queue.project_create(create_payload(id, owner)).await.unwrap();
            while h.run_next().await.is_some() {}
        }

        h.queue
            .projects_delete_all_for_user(ProjectsDeleteAllForUser {
                owner_user_id: UserId::parse("u1").unwrap(),
            })
            .await
            .unwrap();

        while h.run_next().await.is_some() {}

        assert!(h.projects.get(&ProjectId::parse("p1").unwrap()).await.unwrap().is_none());
        assert!(h.projects.get(&ProjectId::parse("p2").unwrap()).await.unwrap().is_none());
        assert!(h.projects.get(&ProjectId::parse("p3").unwrap()).await.unwrap().is_some());
    }
}
