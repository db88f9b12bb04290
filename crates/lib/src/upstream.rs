//! Upstream ChatGPT backend client.
//!
//! One operation: ask a question, threading the conversation-continuation
//! identifiers from the previous turn. The session loop owns those ids and
//! interprets a non-empty `error` field as a logical failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("chatgpt request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chatgpt api error: {0}")]
    Api(String),
}

#[derive(Debug, Serialize)]
struct AskRequest<'a> {
    message_id: String,
    conversation_id: &'a str,
    parent_id: &'a str,
    content: &'a str,
}

/// Backend reply payload. `conversation_id` and `response_id` become the
/// session's continuation identifiers after a successful turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AskResponse {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub response_id: String,
    #[serde(default)]
    pub content: String,
    /// Non-empty when the backend handled the request but could not answer.
    #[serde(default)]
    pub error: String,
}

/// Seam between the session loop and the backend, mockable in tests.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Ask the backend with continuation ids from the previous turn
    /// (empty strings on first contact).
    async fn ask(
        &self,
        text: &str,
        conversation_id: &str,
        last_message_id: &str,
    ) -> Result<AskResponse, UpstreamError>;
}

/// HTTP client for the ChatGPT relay backend.
#[derive(Clone)]
pub struct ChatGptClient {
    host: String,
    token: String,
    client: reqwest::Client,
}

impl ChatGptClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(host: &str, token: String, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl Upstream for ChatGptClient {
    async fn ask(
        &self,
        text: &str,
        conversation_id: &str,
        last_message_id: &str,
    ) -> Result<AskResponse, UpstreamError> {
        let url = format!("{}/api/ask", self.host);
        let body = AskRequest {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            parent_id: last_message_id,
            content: text,
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Api(format!("{} {}", status, body)));
        }
        let data: AskResponse = res.json().await?;
        Ok(data)
    }
}
