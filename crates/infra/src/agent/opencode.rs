//! OpenCode HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{AgentClient, AgentError, PromptRequest, PromptStatus};

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
}

/// Per-request timeout of the HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl OpenCodeClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Client(e.to_string()))?;
        Ok(Self { http })
    }

    async fn post(&self, url: String, body: Option<Value>) -> Result<reqwest::Response, AgentError> {
        let mut req = self.http.post(&url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        check(resp).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, AgentError> {
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        check(resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AgentError::Decode(e.to_string()))
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(AgentError::Status { status, body })
}

#[async_trait]
impl AgentClient for OpenCodeClient {
    #[instrument(skip(self), err)]
    async fn create_session(&self, endpoint: &str, title: &str) -> Result<String, AgentError> {
        #[derive(Deserialize)]
        struct Session {
            id: String,
        }

        let resp = self
            .post(format!("{endpoint}/session"), Some(json!({ "title": title })))
            .await?;
        let session: Session = resp
            .json()
            .await
            .map_err(|e| AgentError::Decode(e.to_string()))?;
        debug!(session_id = %session.id, "agent session created");
        Ok(session.id)
    }

    #[instrument(skip(self, prompt), fields(message_id = %prompt.message_id), err)]
    async fn send_prompt(
        &self,
        endpoint: &str,
        session_id: &str,
        prompt: &PromptRequest,
    ) -> Result<(), AgentError> {
        self.post(
            format!("{endpoint}/session/{session_id}/prompt_async"),
            Some(prompt_body(prompt)),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn prompt_status(
        &self,
        endpoint: &str,
        session_id: &str,
        message_id: &str,
    ) -> Result<PromptStatus, AgentError> {
        let messages: Vec<Message> = self
            .get_json(format!("{endpoint}/session/{session_id}/message"))
            .await?;
        Ok(status_of(&messages, message_id))
    }

    #[instrument(skip(self), err)]
    async fn abort(&self, endpoint: &str, session_id: &str) -> Result<(), AgentError> {
        self.post(format!("{endpoint}/session/{session_id}/abort"), None)
            .await?;
        Ok(())
    }
}

fn prompt_body(prompt: &PromptRequest) -> Value {
    let (provider, model) = prompt
        .model
        .split_once('/')
        .unwrap_or(("", prompt.model.as_str()));

    let mut parts = vec![json!({ "type": "text", "text": prompt.text })];
    parts.extend(prompt.images.iter().map(|url| {
        json!({ "type": "file", "mime": image_mime(url), "url": url })
    }));

    json!({
        "messageID": prompt.message_id,
        "model": { "providerID": provider, "modelID": model },
        "parts": parts,
    })
}

fn image_mime(url: &str) -> &str {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, _)) = rest.split_once(';') {
            return mime;
        }
    }
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    info: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    id: String,
    role: String,
    #[serde(rename = "parentID", default)]
    parent_id: Option<String>,
    #[serde(default)]
    time: MessageTime,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageTime {
    #[serde(default)]
    completed: Option<i64>,
}

/// Completion is the assistant reply to `message_id`: done once it carries a
/// completion time, failed once it carries an error.
fn status_of(messages: &[Message], message_id: &str) -> PromptStatus {
    if !messages.iter().any(|m| m.info.id == message_id) {
        return PromptStatus::NotFound;
    }

    let replies = messages.iter().filter(|m| {
        m.info.role == "assistant" && m.info.parent_id.as_deref() == Some(message_id)
    });

    let mut status = PromptStatus::Pending;
    for reply in replies {
        if let Some(error) = &reply.info.error {
            return PromptStatus::Failed(error_message(error));
        }
        if reply.info.time.completed.is_some() {
            status = PromptStatus::Completed;
        } else {
            // A later reply is still streaming.
            status = PromptStatus::Pending;
        }
    }
    status
}

fn error_message(error: &Value) -> String {
    error
        .pointer("/data/message")
        .and_then(Value::as_str)
        .or_else(|| error.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(value: Value) -> Vec<Message> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unknown_message_is_not_found() {
        let msgs = messages(json!([
            {"info": {"id": "msg_other", "role": "user"}, "parts": []}
        ]));
        assert_eq!(status_of(&msgs, "msg_1"), PromptStatus::NotFound);
    }

    #[test]
    fn reply_without_completion_is_pending() {
        let msgs = messages(json!([
            {"info": {"id": "msg_1", "role": "user", "time": {"created": 1}}, "parts": []},
            {"info": {"id": "msg_2", "role": "assistant", "parentID": "msg_1", "time": {"created": 2}}, "parts": []}
        ]));
        assert_eq!(status_of(&msgs, "msg_1"), PromptStatus::Pending);

        let no_reply = messages(json!([
            {"info": {"id": "msg_1", "role": "user"}, "parts": []}
        ]));
        assert_eq!(status_of(&no_reply, "msg_1"), PromptStatus::Pending);
    }

    #[test]
    fn completed_reply_completes_the_prompt() {
        let msgs = messages(json!([
            {"info": {"id": "msg_1", "role": "user"}, "parts": []},
            {"info": {"id": "msg_2", "role": "assistant", "parentID": "msg_1",
                      "time": {"created": 2, "completed": 3}}, "parts": []},
            {"info": {"id": "msg_3", "role": "assistant", "parentID": "msg_0",
                      "time": {"created": 1}}, "parts": []}
        ]));
        assert_eq!(status_of(&msgs, "msg_1"), PromptStatus::Completed);
    }

    #[test]
    fn errored_reply_fails_the_prompt() {
        let msgs = messages(json!([
            {"info": {"id": "msg_1", "role": "user"}, "parts": []},
            {"info": {"id": "msg_2", "role": "assistant", "parentID": "msg_1",
                      "error": {"name": "ProviderAuthError", "data": {"message": "bad key"}}},
             "parts": []}
        ]));
        assert_eq!(
            status_of(&msgs, "msg_1"),
            PromptStatus::Failed("bad key".to_string())
        );
    }

    #[test]
    fn prompt_body_shape() {
        let body = prompt_body(&PromptRequest {
            message_id: "msg_1".to_string(),
            text: "hello".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            images: vec!["data:image/jpeg;base64,AAAA".to_string()],
        });
        assert_eq!(body["messageID"], "msg_1");
        assert_eq!(body["model"]["providerID"], "anthropic");
        assert_eq!(body["model"]["modelID"], "claude-sonnet-4");
        assert_eq!(body["parts"][0]["text"], "hello");
        assert_eq!(body["parts"][1]["mime"], "image/jpeg");
    }

    #[tokio::test]
    async fn request_timeout_is_enforced() {
        // Accepts the connection, never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = OpenCodeClient::new(Duration::from_millis(100)).unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.create_session(&format!("http://{addr}"), "test"),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let client = OpenCodeClient::new(Duration::from_millis(200)).unwrap();
        let err = client
            .create_session("http://127.0.0.1:9", "test")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert!(!err.is_permanent());
    }
}
