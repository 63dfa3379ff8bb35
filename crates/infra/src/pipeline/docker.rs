//! Development container group: start, wait for health, stop.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use sandcastle_projects::{compose_project_name, ProjectStatus};

use crate::jobs::payload::{DockerComposeUp, DockerStop, DockerWaitReady, OpencodeSessionCreate};
use crate::jobs::{HandlerError, JobContext, JobHandler, JobOutcome};
use crate::runtime::readiness;

use super::{cancelled_before_next_step, wait_step, PipelineDeps, WaitStep};

/// `docker.composeUp`
pub struct ComposeUpHandler {
    deps: Arc<PipelineDeps>,
}

impl ComposeUpHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for ComposeUpHandler {
    #[instrument(name = "docker.composeUp", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let DockerComposeUp { project_id } = ctx.payload()?;
        let deps = &self.deps;
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        deps.set_status(&project_id, ProjectStatus::Starting, None)
            .await?;
        deps.runtime
            .up(
                &compose_project_name(&project_id),
                &deps.compose_dir(&project_id),
                false,
            )
            .await?;

        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        ctx.queue()
            .docker_wait_ready(DockerWaitReady {
                project_id,
                started_at: deps.clock.now(),
                reschedule_count: 0,
            })
            .await?;
        Ok(JobOutcome::Success)
    }
}

/// `docker.waitReady`: one health poll per run.
pub struct WaitReadyHandler {
    deps: Arc<PipelineDeps>,
}

impl WaitReadyHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for WaitReadyHandler {
    #[instrument(name = "docker.waitReady", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let payload: DockerWaitReady = ctx.payload()?;
        let deps = &self.deps;
        let project_id = payload.project_id.clone();
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        let compose = compose_project_name(&project_id);
        let dir = deps.compose_dir(&project_id);
        let containers = deps.runtime.status(&compose, &dir).await?;
        let step = wait_step(
            readiness(&containers),
            deps.budget_left(payload.started_at),
            deps.settings.ready_poll,
            payload.reschedule_count,
        );

        match step {
            WaitStep::Ready => {
                info!(
                    project_id = %project_id,
                    elapsed_ms = deps.elapsed_since(payload.started_at).as_millis() as u64,
                    "containers ready"
                );
                deps.set_status(&project_id, ProjectStatus::AgentStarting, None)
                    .await?;
                if cancelled_before_next_step(ctx).await? {
                    return Ok(JobOutcome::Cancelled);
                }
                ctx.queue()
                    .opencode_session_create(OpencodeSessionCreate::new(project_id))
                    .await?;
                Ok(JobOutcome::Success)
            }
            WaitStep::Poll(delay) => {
                debug!(project_id = %project_id, "containers not ready yet");
                Ok(JobOutcome::Reschedule(delay))
            }
            WaitStep::Restart(reason) => {
                warn!(project_id = %project_id, %reason, "restarting container group");
                deps.runtime.up(&compose, &dir, false).await?;
                if cancelled_before_next_step(ctx).await? {
                    return Ok(JobOutcome::Cancelled);
                }
                ctx.queue()
                    .docker_wait_ready(DockerWaitReady {
                        project_id,
                        started_at: deps.clock.now(),
                        reschedule_count: payload.reschedule_count + 1,
                    })
                    .await?;
                Ok(JobOutcome::Success)
            }
            WaitStep::GiveUp(reason) => {
                let message = format!("container group never became ready: {reason}");
                deps.set_status(&project_id, ProjectStatus::Error, Some(message.clone()))
                    .await?;
                Err(HandlerError::permanent(message))
            }
        }
    }
}

/// `docker.stop`: stop the dev group, keeping its volumes.
pub struct StopHandler {
    deps: Arc<PipelineDeps>,
}

impl StopHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for StopHandler {
    #[instrument(name = "docker.stop", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let DockerStop { project_id } = ctx.payload()?;
        let deps = &self.deps;
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        deps.runtime
            .down(
                &compose_project_name(&project_id),
                &deps.compose_dir(&project_id),
            )
            .await?;
        deps.set_status(&project_id, ProjectStatus::Stopped, None)
            .await?;
        Ok(JobOutcome::Success)
    }
}
