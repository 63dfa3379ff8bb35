//! Coding-agent session boundary.
//!
//! Each project runs an agent server next to its dev container. Prompts are
//! sent with a message id chosen by the caller, so a job that re-runs after a
//! crash can find the message it already sent instead of sending it twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::HandlerError;
use sandcastle_core::JobId;

pub mod in_memory;
pub mod opencode;

pub use in_memory::InMemoryAgent;
pub use opencode::OpenCodeClient;

/// Default agent endpoint; `{project}` is the compose project name.
pub const DEFAULT_ENDPOINT_TEMPLATE: &str = "http://{project}-agent-1:4096";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Transport(String),
    #[error("HTTP {status} from OpenCode: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Decode(String),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl AgentError {
    /// Client errors other than timeouts and throttling will not go away on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AgentError::Status { status, .. }
            if (400..500).contains(status) && *status != 408 && *status != 429)
    }
}

impl From<AgentError> for HandlerError {
    fn from(err: AgentError) -> Self {
        if err.is_permanent() {
            HandlerError::permanent(err.to_string())
        } else {
            HandlerError::transient(err.to_string())
        }
    }
}

/// One prompt turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub message_id: String,
    pub text: String,
    /// `provider/model`
    pub model: String,
    /// Image URLs or data URLs.
    pub images: Vec<String>,
}

/// Progress of a prompt sent with [`AgentClient::send_prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptStatus {
    /// The agent has no message with that id.
    NotFound,
    Pending,
    Completed,
    Failed(String),
}

/// Message id for the prompt sent by `job`. Stable across re-runs of the job.
pub fn prompt_message_id(job: JobId) -> String {
    format!("msg_{}", job.as_uuid().simple())
}

/// Agent endpoint for a compose project.
pub fn endpoint_for(template: &str, compose_project: &str) -> String {
    template.replace("{project}", compose_project)
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Create a session and return its id.
    async fn create_session(&self, endpoint: &str, title: &str) -> Result<String, AgentError>;

    /// Queue a prompt without waiting for the reply.
    async fn send_prompt(
        &self,
        endpoint: &str,
        session_id: &str,
        prompt: &PromptRequest,
    ) -> Result<(), AgentError>;

    async fn prompt_status(
        &self,
        endpoint: &str,
        session_id: &str,
        message_id: &str,
    ) -> Result<PromptStatus, AgentError>;

    /// Stop whatever the session is working on.
    async fn abort(&self, endpoint: &str, session_id: &str) -> Result<(), AgentError>;
}
