//! Production deployments: build a snapshot of the app, run it, stop it.
//!
//! Each deployment is its own compose project named after the content hash
//! of the sources, so rebuilding unchanged sources converges on the same
//! group. Starting a new hash stops the previous one first since both
//! publish the same port.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use sandcastle_core::ProjectId;
use sandcastle_projects::{production_project_name, ProductionDeployment, ProductionStatus};

use crate::jobs::payload::{ProductionBuild, ProductionStart, ProductionStop, ProductionWaitReady};
use crate::jobs::{HandlerError, JobContext, JobHandler, JobOutcome};
use crate::runtime::readiness;

use super::{cancelled_before_next_step, wait_step, PipelineDeps, WaitStep};

/// Where a deployment published on `port` is reachable.
pub fn production_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

impl PipelineDeps {
    /// Update the project's deployment record if it still describes `hash`.
    async fn update_production(
        &self,
        id: &ProjectId,
        hash: &str,
        f: impl FnOnce(&mut ProductionDeployment),
    ) -> Result<(), HandlerError> {
        let Some(project) = self.projects.get(id).await? else {
            return Ok(());
        };
        match project.production {
            Some(mut deployment) if deployment.hash == hash => {
                f(&mut deployment);
                self.projects.set_production(id, Some(deployment)).await?;
            }
            _ => warn!(project_id = %id, hash, "deployment record superseded; not updating"),
        }
        Ok(())
    }
}

/// `production.build`
pub struct BuildHandler {
    deps: Arc<PipelineDeps>,
}

impl BuildHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for BuildHandler {
    #[instrument(name = "production.build", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let ProductionBuild {
            project_id,
            production_port,
        } = ctx.payload()?;
        let deps = &self.deps;
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        let hash = deps.workspace.content_hash(&project_id).await?;
        let dir = deps
            .workspace
            .write_production(&project_id, &hash, production_port)
            .await?;
        deps.projects
            .set_production(
                &project_id,
                Some(ProductionDeployment::building(&hash, production_port)),
            )
            .await?;

        deps.runtime
            .build(&production_project_name(&project_id, &hash), &dir)
            .await?;
        info!(project_id = %project_id, %hash, "production image built");

        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        ctx.queue()
            .production_start(ProductionStart {
                project_id,
                production_port,
                production_hash: hash,
            })
            .await?;
        Ok(JobOutcome::Success)
    }
}

/// `production.start`
pub struct StartHandler {
    deps: Arc<PipelineDeps>,
}

impl StartHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for StartHandler {
    #[instrument(name = "production.start", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let ProductionStart {
            project_id,
            production_port,
            production_hash,
        } = ctx.payload()?;
        let deps = &self.deps;
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        for other in deps.workspace.production_hashes(&project_id).await? {
            if other != production_hash {
                deps.runtime
                    .down(
                        &production_project_name(&project_id, &other),
                        &deps.workspace.production_dir(&project_id, &other),
                    )
                    .await?;
            }
        }

        deps.runtime
            .up(
                &production_project_name(&project_id, &production_hash),
                &deps.workspace.production_dir(&project_id, &production_hash),
                false,
            )
            .await?;
        deps.update_production(&project_id, &production_hash, |d| {
            d.status = ProductionStatus::Starting;
            d.last_error = None;
        })
        .await?;

        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        ctx.queue()
            .production_wait_ready(ProductionWaitReady {
                project_id,
                production_port,
                production_hash,
                started_at: deps.clock.now(),
                reschedule_count: 0,
            })
            .await?;
        Ok(JobOutcome::Success)
    }
}

/// `production.waitReady`: one health poll per run.
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
    #[instrument(name = "production.waitReady", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let payload: ProductionWaitReady = ctx.payload()?;
        let deps = &self.deps;
        let project_id = payload.project_id.clone();
        let hash = payload.production_hash.clone();
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        let name = production_project_name(&project_id, &hash);
        let dir = deps.workspace.production_dir(&project_id, &hash);
        let containers = deps.runtime.status(&name, &dir).await?;
        let step = wait_step(
            readiness(&containers),
            deps.budget_left(payload.started_at),
            deps.settings.ready_poll,
            payload.reschedule_count,
        );

        match step {
            WaitStep::Ready => {
                let url = production_url(payload.production_port);
                info!(project_id = %project_id, %hash, %url, "production deployment running");
                deps.update_production(&project_id, &hash, |d| {
                    d.status = ProductionStatus::Running;
                    d.url = Some(url);
                })
                .await?;
                Ok(JobOutcome::Success)
            }
            WaitStep::Poll(delay) => Ok(JobOutcome::Reschedule(delay)),
            WaitStep::Restart(reason) => {
                warn!(project_id = %project_id, %hash, %reason, "restarting production deployment");
                deps.runtime.up(&name, &dir, false).await?;
                if cancelled_before_next_step(ctx).await? {
                    return Ok(JobOutcome::Cancelled);
                }
                ctx.queue()
                    .production_wait_ready(ProductionWaitReady {
                        started_at: deps.clock.now(),
                        reschedule_count: payload.reschedule_count + 1,
                        ..payload
                    })
                    .await?;
                Ok(JobOutcome::Success)
            }
            WaitStep::GiveUp(reason) => {
                let message = format!("production deployment never became ready: {reason}");
                let recorded = message.clone();
                deps.update_production(&project_id, &hash, move |d| {
                    d.status = ProductionStatus::Failed;
                    d.last_error = Some(recorded);
                })
                .await?;
                Err(HandlerError::permanent(message))
            }
        }
    }
}

/// `production.stop`: stop one deployment, by default the current one.
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
    #[instrument(name = "production.stop", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let ProductionStop {
            project_id,
            production_hash,
        } = ctx.payload()?;
        let deps = &self.deps;
        let Some(project) = deps.active_project(&project_id).await? else {
            return Ok(JobOutcome::Success);
        };

        let hash = match production_hash.or_else(|| project.production.map(|d| d.hash)) {
            Some(hash) => hash,
            None => {
                info!(project_id = %project_id, "no production deployment to stop");
                return Ok(JobOutcome::Success);
            }
        };

        deps.runtime
            .down(
                &production_project_name(&project_id, &hash),
                &deps.workspace.production_dir(&project_id, &hash),
            )
            .await?;
        deps.update_production(&project_id, &hash, |d| {
            d.status = ProductionStatus::Stopped;
            d.url = None;
        })
        .await?;
        Ok(JobOutcome::Success)
    }
}
