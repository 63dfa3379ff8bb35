//! Agent session and prompt turns.
//!
//! A prompt job sends its message under an id derived from the job id, then
//! polls until the agent's reply to exactly that message completes. A re-run
//! of the same job finds the message it already sent and keeps waiting
//! instead of sending it again.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use sandcastle_core::ProjectId;
use sandcastle_projects::ProjectStatus;

use crate::agent::{prompt_message_id, PromptRequest, PromptStatus};
use crate::jobs::payload::{
    OpencodeSendInitialPrompt, OpencodeSendUserPrompt, OpencodeSessionCreate,
};
use crate::jobs::{HandlerError, JobContext, JobHandler, JobOutcome};

use super::{cancelled_before_next_step, PipelineDeps};

/// How a prompt turn ended, short of an error.
#[derive(Debug, PartialEq, Eq)]
enum Turn {
    Completed,
    Cancelled,
}

async fn run_prompt(
    deps: &PipelineDeps,
    ctx: &JobContext,
    project_id: &ProjectId,
    session_id: &str,
    text: String,
    model: String,
    images: Vec<String>,
) -> Result<Turn, HandlerError> {
    let endpoint = deps.agent_endpoint(project_id);
    let message_id = prompt_message_id(ctx.job_id());

    match deps
        .agent
        .prompt_status(&endpoint, session_id, &message_id)
        .await?
    {
        PromptStatus::NotFound => {
            let request = PromptRequest {
                message_id: message_id.clone(),
                text,
                model,
                images,
            };
            deps.agent
                .send_prompt(&endpoint, session_id, &request)
                .await?;
            debug!(%message_id, "prompt sent");
        }
        PromptStatus::Completed => return Ok(Turn::Completed),
        PromptStatus::Failed(reason) => {
            return Err(HandlerError::permanent(format!("agent failed: {reason}")));
        }
        PromptStatus::Pending => info!(%message_id, "resuming wait for prompt sent earlier"),
    }

    let deadline = Instant::now() + deps.settings.prompt_timeout;
    loop {
        match deps
            .agent
            .prompt_status(&endpoint, session_id, &message_id)
            .await?
        {
            PromptStatus::Completed => return Ok(Turn::Completed),
            PromptStatus::Failed(reason) => {
                return Err(HandlerError::permanent(format!("agent failed: {reason}")));
            }
            PromptStatus::Pending | PromptStatus::NotFound => {}
        }

        if ctx.checkpoint().await? {
            abort_quietly(deps, &endpoint, session_id).await;
            return Ok(Turn::Cancelled);
        }
        if Instant::now() >= deadline {
            abort_quietly(deps, &endpoint, session_id).await;
            return Err(HandlerError::permanent(format!(
                "agent did not answer within {}s",
                deps.settings.prompt_timeout.as_secs()
            )));
        }
        tokio::time::sleep(deps.settings.prompt_poll).await;
    }
}

async fn abort_quietly(deps: &PipelineDeps, endpoint: &str, session_id: &str) {
    if let Err(e) = deps.agent.abort(endpoint, session_id).await {
        warn!(session_id, error = %e, "failed to abort agent session");
    }
}

/// `opencode.sessionCreate`
pub struct SessionCreateHandler {
    deps: Arc<PipelineDeps>,
}

impl SessionCreateHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for SessionCreateHandler {
    #[instrument(name = "opencode.sessionCreate", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let OpencodeSessionCreate { project_id } = ctx.payload()?;
        let deps = &self.deps;
        let Some(project) = deps.active_project(&project_id).await? else {
            return Ok(JobOutcome::Success);
        };

        let session_id = match project.session_id {
            Some(existing) => existing,
            None => {
                let endpoint = deps.agent_endpoint(&project_id);
                let id = deps.agent.create_session(&endpoint, &project.name).await?;
                deps.projects
                    .set_session(&project_id, Some(id.clone()))
                    .await?;
                info!(project_id = %project_id, session_id = %id, "agent session created");
                id
            }
        };

        if cancelled_before_next_step(ctx).await? {
            return Ok(JobOutcome::Cancelled);
        }
        ctx.queue()
            .opencode_send_initial_prompt(OpencodeSendInitialPrompt {
                project_id,
                session_id,
            })
            .await?;
        Ok(JobOutcome::Success)
    }
}

/// `opencode.sendInitialPrompt`: set the project up, then queue the user's prompt.
pub struct SendInitialPromptHandler {
    deps: Arc<PipelineDeps>,
}

impl SendInitialPromptHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for SendInitialPromptHandler {
    #[instrument(name = "opencode.sendInitialPrompt", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let OpencodeSendInitialPrompt {
            project_id,
            session_id,
        } = ctx.payload()?;
        let deps = &self.deps;
        let Some(project) = deps.active_project(&project_id).await? else {
            return Ok(JobOutcome::Success);
        };

        deps.set_status(&project_id, ProjectStatus::Working, None)
            .await?;
        let turn = run_prompt(
            deps,
            ctx,
            &project_id,
            &session_id,
            deps.settings.initial_prompt.clone(),
            project.model.clone(),
            Vec::new(),
        )
        .await;

        match fail_project_on_permanent(deps, &project_id, turn).await? {
            Turn::Cancelled => Ok(JobOutcome::Cancelled),
            Turn::Completed => {
                if cancelled_before_next_step(ctx).await? {
                    return Ok(JobOutcome::Cancelled);
                }
                ctx.queue()
                    .opencode_send_user_prompt(OpencodeSendUserPrompt {
                        project_id,
                        session_id,
                        prompt: project.prompt,
                        model: project.model,
                        images: project.images,
                    })
                    .await?;
                Ok(JobOutcome::Success)
            }
        }
    }
}

/// `opencode.sendUserPrompt`: one user turn; the project is idle afterwards.
pub struct SendUserPromptHandler {
    deps: Arc<PipelineDeps>,
}

impl SendUserPromptHandler {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for SendUserPromptHandler {
    #[instrument(name = "opencode.sendUserPrompt", skip_all, fields(job_id = %ctx.job_id()))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        let payload: OpencodeSendUserPrompt = ctx.payload()?;
        let deps = &self.deps;
        let project_id = payload.project_id;
        if deps.active_project(&project_id).await?.is_none() {
            return Ok(JobOutcome::Success);
        }

        deps.set_status(&project_id, ProjectStatus::Working, None)
            .await?;
        let turn = run_prompt(
            deps,
            ctx,
            &project_id,
            &payload.session_id,
            payload.prompt,
            payload.model,
            payload.images,
        )
        .await;

        match fail_project_on_permanent(deps, &project_id, turn).await? {
            Turn::Cancelled => Ok(JobOutcome::Cancelled),
            Turn::Completed => {
                deps.set_status(&project_id, ProjectStatus::Idle, None)
                    .await?;
                info!(project_id = %project_id, "prompt completed");
                Ok(JobOutcome::Success)
            }
        }
    }
}

/// Record permanent prompt failures on the project before failing the job.
async fn fail_project_on_permanent(
    deps: &PipelineDeps,
    project_id: &ProjectId,
    turn: Result<Turn, HandlerError>,
) -> Result<Turn, HandlerError> {
    match turn {
        Err(e) if e.is_permanent() => {
            deps.set_status(project_id, ProjectStatus::Error, Some(e.to_string()))
                .await?;
            Err(e)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::{AgentClient, InMemoryAgent};
    use crate::jobs::{JobStore, JobType, Settled};
    use crate::pipeline::testing::Harness;
    use crate::pipeline::PipelineSettings;
    use crate::project_store::ProjectStore;
    use sandcastle_core::UserId;
    use sandcastle_projects::Project;

    const ENDPOINT: &str = "http://sc-p1-agent-1:4096";

    async fn seeded(h: &Harness) -> ProjectId {
        let id = ProjectId::parse("p1").unwrap();
        let project = Project::new(
            id.clone(),
            UserId::parse("u1").unwrap(),
            "Todo",
            "build a todo app",
            "anthropic/claude-sonnet-4",
            vec!["https://cdn.example.com/mock.png".to_string()],
        );
        h.projects.upsert(&project).await.unwrap();
        id
    }

    fn user_prompt(id: &ProjectId, session_id: &str) -> OpencodeSendUserPrompt {
        OpencodeSendUserPrompt {
            project_id: id.clone(),
            session_id: session_id.to_string(),
            prompt: "add a dark mode".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            images: vec![],
        }
    }

    async fn status(h: &Harness, id: &ProjectId) -> ProjectStatus {
        h.projects.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn session_create_stores_session_and_chains_prompts() {
        let h = Harness::new();
        let id = seeded(&h).await;
        h.queue
            .opencode_session_create(OpencodeSessionCreate::new(id.clone()))
            .await
            .unwrap();

        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
        let session = h.projects.get(&id).await.unwrap().unwrap().session_id.unwrap();
        assert_eq!(h.agent.session_endpoint(&session).as_deref(), Some(ENDPOINT));

        assert_eq!(h.run_next().await, Some(Settled::Succeeded)); // initial prompt
        assert_eq!(h.run_next().await, Some(Settled::Succeeded)); // user prompt
        assert_eq!(h.run_next().await, None);

        let prompts = h.agent.prompts(&session);
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].text, PipelineSettings::default().initial_prompt);
        assert_eq!(prompts[1].text, "build a todo app");
        assert_eq!(prompts[1].images.len(), 1);
        assert_eq!(status(&h, &id).await, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn existing_session_is_reused() {
        let h = Harness::new();
        let id = seeded(&h).await;
        let session = h.agent.create_session(ENDPOINT, "Todo").await.unwrap();
        h.projects.set_session(&id, Some(session.clone())).await.unwrap();

        h.queue
            .opencode_session_create(OpencodeSessionCreate::new(id.clone()))
            .await
            .unwrap();
        h.run_next().await;

        assert_eq!(h.agent.session_count(), 1);
        let next = h.latest(JobType::OpencodeSendInitialPrompt).await;
        assert_eq!(next.payload["sessionId"], session.as_str());
    }

    #[tokio::test]
    async fn rerun_does_not_resend_the_message() {
        let h = Harness::new();
        let id = seeded(&h).await;
        let session = h.agent.create_session(ENDPOINT, "Todo").await.unwrap();

        let job_id = h
            .queue
            .opencode_send_user_prompt(user_prompt(&id, &session))
            .await
            .unwrap();
        // As if an earlier run sent it before the worker died.
        let sent = PromptRequest {
            message_id: prompt_message_id(job_id),
            text: "add a dark mode".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            images: vec![],
        };
        h.agent.send_prompt(ENDPOINT, &session, &sent).await.unwrap();

        assert_eq!(h.run_next().await, Some(Settled::Succeeded));
        assert_eq!(h.agent.prompts(&session).len(), 1);
        assert_eq!(status(&h, &id).await, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn cancel_aborts_the_session() {
        let h = Harness::with_agent(InMemoryAgent::with_manual_completion());
        let id = seeded(&h).await;
        let session = h.agent.create_session(ENDPOINT, "Todo").await.unwrap();
        let job_id = h
            .queue
            .opencode_send_user_prompt(user_prompt(&id, &session))
            .await
            .unwrap();

        let (settled, _) = tokio::join!(h.run_next(), async {
            while h.agent.prompts(&session).is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            h.store.request_cancel(job_id).await.unwrap();
        });

        assert_eq!(settled, Some(Settled::Cancelled));
        assert_eq!(h.agent.aborts(&session), 1);
    }

    #[tokio::test]
    async fn agent_failure_marks_project_error() {
        let h = Harness::with_agent(InMemoryAgent::with_manual_completion());
        let id = seeded(&h).await;
        let session = h.agent.create_session(ENDPOINT, "Todo").await.unwrap();
        let job_id = h
            .queue
            .opencode_send_user_prompt(user_prompt(&id, &session))
            .await
            .unwrap();

        let (settled, _) = tokio::join!(h.run_next(), async {
            while h.agent.prompts(&session).is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            h.agent.finish(
                &prompt_message_id(job_id),
                PromptStatus::Failed("provider overloaded".into()),
            );
        });

        assert_eq!(settled, Some(Settled::Failed { attempts: 0 }));
        let project = h.projects.get(&id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
        assert!(project.last_error.unwrap().contains("provider overloaded"));
    }

    #[tokio::test]
    async fn prompt_timeout_aborts_and_fails() {
        let h = Harness::build(
            InMemoryAgent::with_manual_completion(),
            PipelineSettings {
                prompt_poll: Duration::from_millis(5),
                prompt_timeout: Duration::from_millis(30),
                ..PipelineSettings::default()
            },
        );
        let id = seeded(&h).await;
        let session = h.agent.create_session(ENDPOINT, "Todo").await.unwrap();
        h.queue
            .opencode_send_user_prompt(user_prompt(&id, &session))
            .await
            .unwrap();

        assert_eq!(h.run_next().await, Some(Settled::Failed { attempts: 0 }));
        assert_eq!(h.agent.aborts(&session), 1);
        assert_eq!(status(&h, &id).await, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn unknown_session_fails_permanently() {
        let h = Harness::new();
        let id = seeded(&h).await;
        h.queue
            .opencode_send_user_prompt(user_prompt(&id, "ses_gone"))
            .await
            .unwrap();

        assert_eq!(h.run_next().await, Some(Settled::Failed { attempts: 0 }));
    }
}
