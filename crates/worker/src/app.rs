//! Composition root: build the services from configuration, register the
//! pipeline handlers and run the executors.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use sandcastle_infra::agent::{opencode, AgentClient, OpenCodeClient};
use sandcastle_infra::config::SandcastleConfig;
use sandcastle_infra::db;
use sandcastle_infra::jobs::{
    ExecutorStats, HandlerRegistry, InMemoryJobStore, JobExecutor, JobExecutorHandle, JobQueue,
    JobStore, PostgresJobStore, QueueAdmin,
};
use sandcastle_infra::pipeline::{register_pipeline, PipelineDeps};
use sandcastle_infra::project_store::{InMemoryProjectStore, PostgresProjectStore, ProjectStore};
use sandcastle_infra::runtime::{ComposeCli, ContainerRuntime};
use sandcastle_infra::workspace::Workspace;

/// The collaborators the executors and handlers run against.
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub agent: Arc<dyn AgentClient>,
}

impl Services {
    /// Postgres stores when `persistent` is set, in-memory ones otherwise.
    /// Containers and agents are always the real adapters.
    pub async fn from_config(config: &SandcastleConfig) -> anyhow::Result<Self> {
        let (jobs, projects): (Arc<dyn JobStore>, Arc<dyn ProjectStore>) = if config.persistent {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set when SANDCASTLE_PERSISTENT=true")?;
            let pool = db::connect(url).await?;
            db::ensure_schema(&pool)
                .await
                .context("failed to create database schema")?;
            (
                Arc::new(PostgresJobStore::new(pool.clone())),
                Arc::new(PostgresProjectStore::new(pool)),
            )
        } else {
            warn!("SANDCASTLE_PERSISTENT is off; jobs and projects are lost on exit");
            (
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryProjectStore::new()),
            )
        };

        let agent = OpenCodeClient::new(opencode::DEFAULT_TIMEOUT)
            .context("failed to create the agent client")?;

        Ok(Self {
            jobs,
            projects,
            runtime: Arc::new(ComposeCli::new(&config.docker_bin)),
            agent: Arc::new(agent),
        })
    }
}

/// Lease owner id of executor `index`: `<prefix>-<index>-<8 hex>`.
///
/// The random suffix keeps ids unique when a process restarts while its
/// previous leases have not expired yet.
pub fn worker_id(prefix: &str, index: usize) -> String {
    let simple = uuid::Uuid::now_v7().simple().to_string();
    format!("{prefix}-{index}-{}", &simple[simple.len() - 8..])
}

/// Every pipeline handler, wired to `services`.
pub fn build_registry(config: &SandcastleConfig, services: &Services) -> HandlerRegistry {
    let workspace = Arc::new(Workspace::new(
        config.workspace_root.clone(),
        config.workspace.clone(),
    ));
    let deps = PipelineDeps::new(
        services.runtime.clone(),
        services.agent.clone(),
        services.projects.clone(),
        workspace,
        config.pipeline.clone(),
    );

    let mut registry = HandlerRegistry::new();
    register_pipeline(&mut registry, Arc::new(deps));
    registry
}

/// Apply start-up settings and spawn `config.workers` executors.
pub async fn start(config: &SandcastleConfig, services: Services) -> anyhow::Result<RunningApp> {
    let admin = QueueAdmin::new(services.jobs.clone());
    if let Some(concurrency) = config.concurrency {
        admin
            .set_concurrency(concurrency)
            .await
            .context("failed to apply SANDCASTLE_CONCURRENCY")?;
    }

    let registry = build_registry(config, &services);
    let executors = (0..config.workers)
        .map(|index| {
            let executor_config = config.executor_config(worker_id(&config.worker_prefix, index));
            JobExecutor::new(services.jobs.clone(), registry.clone(), executor_config).spawn()
        })
        .collect::<Vec<_>>();

    info!(
        workers = executors.len(),
        handlers = registry.len(),
        persistent = config.persistent,
        "sandcastle worker started"
    );

    Ok(RunningApp {
        queue: JobQueue::new(services.jobs.clone()).with_max_attempts(config.max_attempts),
        admin,
        services,
        executors,
    })
}

/// A started process. Dropping it leaves the executors running detached;
/// call [`RunningApp::shutdown`] to stop them.
pub struct RunningApp {
    queue: JobQueue,
    admin: QueueAdmin,
    services: Services,
    executors: Vec<JobExecutorHandle>,
}

impl RunningApp {
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn admin(&self) -> &QueueAdmin {
        &self.admin
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.executors
            .iter()
            .map(|e| e.worker_id().to_string())
            .collect()
    }

    pub fn stats(&self) -> Vec<ExecutorStats> {
        self.executors.iter().map(JobExecutorHandle::stats).collect()
    }

    /// Stop every executor; in-flight jobs get the configured grace period.
    pub async fn shutdown(self) {
        let handles = self.executors;
        let count = handles.len();
        let mut tasks = tokio::task::JoinSet::new();
        for handle in handles {
            tasks.spawn(handle.shutdown());
        }
        while tasks.join_next().await.is_some() {}
        info!(workers = count, "sandcastle worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_prefixed_and_unique() {
        let a = worker_id("box-7", 0);
        let b = worker_id("box-7", 0);
        assert!(a.starts_with("box-7-0-"));
        assert_eq!(a.len(), "box-7-0-".len() + 8);
        assert!(a["box-7-0-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
