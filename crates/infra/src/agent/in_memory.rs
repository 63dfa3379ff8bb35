//! In-memory agent for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{AgentClient, AgentError, PromptRequest, PromptStatus};

#[derive(Debug, Default)]
struct Session {
    endpoint: String,
    prompts: Vec<(PromptRequest, PromptStatus)>,
    aborts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    next_id: u64,
    manual: bool,
    fail_create: Option<AgentError>,
}

/// Sessions and prompts kept in memory.
///
/// Prompts complete as soon as they are sent unless manual completion is on,
/// in which case they stay pending until [`InMemoryAgent::finish`].
#[derive(Debug, Default)]
pub struct InMemoryAgent {
    inner: Mutex<Inner>,
}

impl InMemoryAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manual_completion() -> Self {
        let agent = Self::default();
        agent.lock().manual = true;
        agent
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the final status of a sent prompt.
    pub fn finish(&self, message_id: &str, status: PromptStatus) {
        let mut inner = self.lock();
        for session in inner.sessions.values_mut() {
            for (prompt, current) in &mut session.prompts {
                if prompt.message_id == message_id {
                    *current = status.clone();
                }
            }
        }
    }

    /// Make the next `create_session` fail.
    pub fn fail_next_create(&self, err: AgentError) {
        self.lock().fail_create = Some(err);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn session_endpoint(&self, session_id: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.endpoint.clone())
    }

    /// Prompts sent to a session, oldest first.
    pub fn prompts(&self, session_id: &str) -> Vec<PromptRequest> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.prompts.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn aborts(&self, session_id: &str) -> u32 {
        self.lock().sessions.get(session_id).map_or(0, |s| s.aborts)
    }

    fn missing(session_id: &str) -> AgentError {
        AgentError::Status {
            status: 404,
            body: format!("session {session_id} not found"),
        }
    }
}

#[async_trait]
impl AgentClient for InMemoryAgent {
    async fn create_session(&self, endpoint: &str, _title: &str) -> Result<String, AgentError> {
        let mut inner = self.lock();
        if let Some(err) = inner.fail_create.take() {
            return Err(err);
        }
        inner.next_id += 1;
        let id = format!("ses_{:04}", inner.next_id);
        inner.sessions.insert(
            id.clone(),
            Session {
                endpoint: endpoint.to_string(),
                ..Session::default()
            },
        );
        Ok(id)
    }

    async fn send_prompt(
        &self,
        _endpoint: &str,
        session_id: &str,
        prompt: &PromptRequest,
    ) -> Result<(), AgentError> {
        let mut inner = self.lock();
        let status = if inner.manual {
            PromptStatus::Pending
        } else {
            PromptStatus::Completed
        };
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::missing(session_id))?;
        if session.prompts.iter().any(|(p, _)| p.message_id == prompt.message_id) {
            return Err(AgentError::Status {
                status: 409,
                body: format!("message {} already exists", prompt.message_id),
            });
        }
        session.prompts.push((prompt.clone(), status));
        Ok(())
    }

    async fn prompt_status(
        &self,
        _endpoint: &str,
        session_id: &str,
        message_id: &str,
    ) -> Result<PromptStatus, AgentError> {
        let inner = self.lock();
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| Self::missing(session_id))?;
        Ok(session
            .prompts
            .iter()
            .find(|(p, _)| p.message_id == message_id)
            .map_or(PromptStatus::NotFound, |(_, s)| s.clone()))
    }

    async fn abort(&self, _endpoint: &str, session_id: &str) -> Result<(), AgentError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::missing(session_id))?;
        session.aborts += 1;
        for (_, status) in &mut session.prompts {
            if *status == PromptStatus::Pending {
                *status = PromptStatus::Failed("aborted".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(id: &str) -> PromptRequest {
        PromptRequest {
            message_id: id.to_string(),
            text: "hi".to_string(),
            model: "anthropic/claude".to_string(),
            images: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_rejected() {
        let agent = InMemoryAgent::new();
        let session = agent.create_session("http://a", "t").await.unwrap();

        agent.send_prompt("http://a", &session, &prompt("msg_1")).await.unwrap();
        let err = agent
            .send_prompt("http://a", &session, &prompt("msg_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 409, .. }));
        assert_eq!(agent.prompts(&session).len(), 1);
    }

    #[tokio::test]
    async fn manual_completion_and_abort() {
        let agent = InMemoryAgent::with_manual_completion();
        let session = agent.create_session("http://a", "t").await.unwrap();

        assert_eq!(
            agent.prompt_status("http://a", &session, "msg_1").await.unwrap(),
            PromptStatus::NotFound
        );
        agent.send_prompt("http://a", &session, &prompt("msg_1")).await.unwrap();
        assert_eq!(
            agent.prompt_status("http://a", &session, "msg_1").await.unwrap(),
            PromptStatus::Pending
        );

        agent.abort("http://a", &session).await.unwrap();
        assert!(matches!(
            agent.prompt_status("http://a", &session, "msg_1").await.unwrap(),
            PromptStatus::Failed(_)
        ));
        assert_eq!(agent.aborts(&session), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_a_404() {
        let agent = InMemoryAgent::new();
        let err = agent.abort("http://a", "ses_missing").await.unwrap_err();
        assert!(err.is_permanent());
    }
}
