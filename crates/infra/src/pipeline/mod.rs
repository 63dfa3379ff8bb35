//! Project pipelines built from chained jobs.
//!
//! Bootstrap: `project.create` -> `docker.composeUp` -> `docker.waitReady` ->
//! `opencode.sessionCreate` -> `opencode.sendInitialPrompt` ->
//! `opencode.sendUserPrompt`.
//!
//! Deployment: `production.build` -> `production.start` ->
//! `production.waitReady`, plus `production.stop`.
//!
//! Teardown: `docker.stop`, `project.delete`, `projects.deleteAllForUser`.
//!
//! Every handler enqueues the next step itself before reporting success.
//! Handlers that find their project deleting stop quietly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sandcastle_core::ProjectId;
use sandcastle_projects::{compose_project_name, Project, ProjectStatus};

use crate::agent::{endpoint_for, AgentClient, DEFAULT_ENDPOINT_TEMPLATE};
use crate::jobs::clock::{to_chrono, Clock, SystemClock};
use crate::jobs::{HandlerError, HandlerRegistry, JobContext, JobType};
use crate::project_store::{ProjectStore, ProjectStoreError};
use crate::runtime::{ContainerRuntime, Readiness};
use crate::workspace::Workspace;

pub mod docker;
pub mod opencode;
pub mod production;
pub mod project;

/// How many times a wait handler restarts a group that never became ready.
pub const MAX_RESTARTS: u32 = 1;

/// Prompt sent before the user's own prompt to set the project up.
pub const DEFAULT_INITIAL_PROMPT: &str = "Read PROMPT.md in the parent directory. \
     Set up a minimal project in the current directory that can be started with \
     `npm start` and listens on $PORT, then stop and wait for instructions.";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Agent URL; `{project}` is replaced with the compose project name.
    pub agent_endpoint_template: String,
    pub ready_poll: Duration,
    /// Time a group gets to become ready, measured from the wait payload's `startedAt`.
    pub ready_budget: Duration,
    pub prompt_poll: Duration,
    pub prompt_timeout: Duration,
    pub initial_prompt: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            agent_endpoint_template: DEFAULT_ENDPOINT_TEMPLATE.to_string(),
            ready_poll: Duration::from_secs(2),
            ready_budget: Duration::from_secs(180),
            prompt_poll: Duration::from_secs(2),
            prompt_timeout: Duration::from_secs(30 * 60),
            initial_prompt: DEFAULT_INITIAL_PROMPT.to_string(),
        }
    }
}

/// Collaborators shared by all pipeline handlers.
pub struct PipelineDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub agent: Arc<dyn AgentClient>,
    pub projects: Arc<dyn ProjectStore>,
    pub workspace: Arc<Workspace>,
    pub settings: PipelineSettings,
    pub clock: Arc<dyn Clock>,
}

impl PipelineDeps {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn AgentClient>,
        projects: Arc<dyn ProjectStore>,
        workspace: Arc<Workspace>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            runtime,
            agent,
            projects,
            workspace,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The project, or `None` while it is being deleted.
    pub(crate) async fn active_project(
        &self,
        id: &ProjectId,
    ) -> Result<Option<Project>, HandlerError> {
        match self.projects.get(id).await? {
            Some(p) if p.is_deleting() => {
                info!(project_id = %id, "project is being deleted; skipping");
                Ok(None)
            }
            Some(p) => Ok(Some(p)),
            None => Err(HandlerError::permanent(format!("project {id} not found"))),
        }
    }

    /// Record a status change. A project that started deleting meanwhile
    /// keeps its status.
    pub(crate) async fn set_status(
        &self,
        id: &ProjectId,
        status: ProjectStatus,
        error: Option<String>,
    ) -> Result<(), HandlerError> {
        match self.projects.set_status(id, status, error).await {
            Ok(_) => Ok(()),
            Err(ProjectStoreError::Conflict(msg)) => {
                warn!(project_id = %id, status = %status, reason = %msg, "status not updated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn compose_dir(&self, id: &ProjectId) -> PathBuf {
        self.workspace.project_dir(id)
    }

    pub(crate) fn agent_endpoint(&self, id: &ProjectId) -> String {
        endpoint_for(
            &self.settings.agent_endpoint_template,
            &compose_project_name(id),
        )
    }

    pub(crate) fn elapsed_since(&self, started_at: chrono::DateTime<chrono::Utc>) -> Duration {
        (self.clock.now() - started_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub(crate) fn budget_left(&self, started_at: chrono::DateTime<chrono::Utc>) -> bool {
        self.clock.now() < started_at + to_chrono(self.settings.ready_budget)
    }
}

/// Renew the lease and check for a cancel request before enqueuing the next
/// step. A cancelled job must not start the rest of its chain: a delete that
/// already tore the project down would otherwise leave new work behind.
pub(crate) async fn cancelled_before_next_step(ctx: &JobContext) -> Result<bool, HandlerError> {
    if ctx.checkpoint().await? {
        info!(job_id = %ctx.job_id(), "cancel requested; not chaining the next step");
        return Ok(true);
    }
    Ok(false)
}

/// What a readiness handler does after one health poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitStep {
    Ready,
    Poll(Duration),
    /// Bring the group up again and start a fresh wait.
    Restart(String),
    GiveUp(String),
}

pub(crate) fn wait_step(
    readiness: Readiness,
    budget_left: bool,
    poll: Duration,
    reschedule_count: u32,
) -> WaitStep {
    let reason = match readiness {
        Readiness::Ready => return WaitStep::Ready,
        Readiness::Pending if budget_left => return WaitStep::Poll(poll),
        Readiness::Pending => "containers did not become ready in time".to_string(),
        Readiness::Failed(reason) => reason,
    };
    if reschedule_count < MAX_RESTARTS {
        WaitStep::Restart(reason)
    } else {
        WaitStep::GiveUp(reason)
    }
}

/// Register a handler for every pipeline job type.
pub fn register_pipeline(registry: &mut HandlerRegistry, deps: Arc<PipelineDeps>) {
    registry
        .register(
            JobType::ProjectCreate,
            project::ProjectCreateHandler::new(deps.clone()),
        )
        .register(
            JobType::ProjectDelete,
            project::ProjectDeleteHandler::new(deps.clone()),
        )
        .register(
            JobType::ProjectsDeleteAllForUser,
            project::DeleteAllForUserHandler::new(deps.clone()),
        )
        .register(
            JobType::DockerComposeUp,
            docker::ComposeUpHandler::new(deps.clone()),
        )
        .register(
            JobType::DockerWaitReady,
            docker::WaitReadyHandler::new(deps.clone()),
        )
        .register(JobType::DockerStop, docker::StopHandler::new(deps.clone()))
        .register(
            JobType::OpencodeSessionCreate,
            opencode::SessionCreateHandler::new(deps.clone()),
        )
        .register(
            JobType::OpencodeSendInitialPrompt,
            opencode::SendInitialPromptHandler::new(deps.clone()),
        )
        .register(
            JobType::OpencodeSendUserPrompt,
            opencode::SendUserPromptHandler::new(deps.clone()),
        )
        .register(
            JobType::ProductionBuild,
            production::BuildHandler::new(deps.clone()),
        )
        .register(
            JobType::ProductionStart,
            production::StartHandler::new(deps.clone()),
        )
        .register(
            JobType::ProductionWaitReady,
            production::WaitReadyHandler::new(deps.clone()),
        )
        .register(JobType::ProductionStop, production::StopHandler::new(deps));
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::agent::InMemoryAgent;
    use crate::jobs::{
        InMemoryJobStore, JobExecutor, JobExecutorConfig, JobFilter, JobQueue, JobStore, ManualClock,
        RetryPolicy, Settled,
    };
    use crate::project_store::InMemoryProjectStore;
    use crate::runtime::InMemoryRuntime;
    use crate::workspace::WorkspaceSettings;

    /// In-memory pipeline with a manual clock.
    pub struct Harness {
        pub store: Arc<InMemoryJobStore>,
        pub queue: JobQueue,
        pub runtime: Arc<InMemoryRuntime>,
        pub agent: Arc<InMemoryAgent>,
        pub projects: Arc<InMemoryProjectStore>,
        pub workspace: Arc<Workspace>,
        pub clock: Arc<ManualClock>,
        pub executor: JobExecutor,
        _root: tempfile::TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_agent(InMemoryAgent::new())
        }

        pub fn with_agent(agent: InMemoryAgent) -> Self {
            Self::build(
                agent,
                PipelineSettings {
                    prompt_poll: Duration::from_millis(5),
                    prompt_timeout: Duration::from_secs(5),
                    ..PipelineSettings::default()
                },
            )
        }

        pub fn build(agent: InMemoryAgent, settings: PipelineSettings) -> Self {
            let root = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
            let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
            let runtime = Arc::new(InMemoryRuntime::new());
            let agent = Arc::new(agent);
            let projects = Arc::new(InMemoryProjectStore::new());
            let workspace = Arc::new(Workspace::new(root.path(), WorkspaceSettings::default()));

            let deps = PipelineDeps::new(
                runtime.clone(),
                agent.clone(),
                projects.clone(),
                workspace.clone(),
                settings,
            )
            .with_clock(clock.clone());

            let mut registry = HandlerRegistry::new();
            register_pipeline(&mut registry, Arc::new(deps));
            let executor = JobExecutor::new(
                store.clone(),
                registry,
                JobExecutorConfig::default()
                    .with_worker_id("test-worker")
                    .with_retry(RetryPolicy::new(Duration::ZERO, Duration::ZERO)),
            );

            Self {
                queue: JobQueue::new(store.clone()),
                store,
                runtime,
                agent,
                projects,
                workspace,
                clock,
                executor,
                _root: root,
            }
        }

        pub async fn run_next(&self) -> Option<Settled> {
            self.executor.run_next().await.unwrap()
        }

        /// Types of all jobs, oldest first.
        pub async fn job_types(&self) -> Vec<String> {
            let mut jobs = self.store.list(&JobFilter::default()).await.unwrap();
            jobs.reverse();
            jobs.into_iter().map(|j| j.job_type).collect()
        }

        /// Newest job of `job_type`.
        pub async fn latest(&self, job_type: JobType) -> crate::jobs::Job {
            self.store
                .list(&JobFilter::default().with_type(job_type))
                .await
                .unwrap()
                .into_iter()
                .next()
                .unwrap()
        }
    }
}
