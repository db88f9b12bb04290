//! Lark Open API client: tenant token + message reply.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const LARK_API_BASE: &str = "https://open.feishu.cn";

/// Outbound reply boundary. The session loop only needs "reply to this
/// message with this text"; delivery failures come back as an error string
/// for logging, never retried.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn reply(&self, message_id: &str, text: &str) -> Result<(), String>;
}

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Client for the Lark Open API (tenant token auth, message reply).
pub struct LarkClient {
    base_url: String,
    app_id: String,
    app_secret: String,
    client: reqwest::Client,
}

impl LarkClient {
    pub fn new(app_id: String, app_secret: String) -> Self {
        Self::with_base_url(LARK_API_BASE.to_string(), app_id, app_secret)
    }

    /// Base URL override for tests or a self-hosted Lark deployment.
    pub fn with_base_url(base_url: String, app_id: String, app_secret: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            client: reqwest::Client::new(),
        }
    }

    /// POST /open-apis/auth/v3/tenant_access_token/internal — exchange app
    /// credentials for a tenant access token.
    async fn tenant_access_token(&self) -> Result<String, String> {
        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let body = json!({ "app_id": self.app_id, "app_secret": self.app_secret });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("tenant_access_token failed: {} {}", status, body));
        }
        let data: TenantTokenResponse = res.json().await.map_err(|e| e.to_string())?;
        if data.code != 0 {
            return Err(format!("tenant_access_token failed: {} {}", data.code, data.msg));
        }
        Ok(data.tenant_access_token)
    }
}

#[async_trait]
impl ReplySender for LarkClient {
    /// POST /open-apis/im/v1/messages/{id}/reply — send a text reply to the
    /// originating message. The uuid deduplicates retried sends on Lark's side.
    async fn reply(&self, message_id: &str, text: &str) -> Result<(), String> {
        let token = self.tenant_access_token().await?;
        let url = format!(
            "{}/open-apis/im/v1/messages/{}/reply",
            self.base_url, message_id
        );
        let content =
            serde_json::to_string(&json!({ "text": text })).map_err(|e| e.to_string())?;
        let body = json!({
            "msg_type": "text",
            "content": content,
            "uuid": uuid::Uuid::new_v4().to_string(),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("reply failed: {} {}", status, body));
        }
        let data: ReplyResponse = res.json().await.map_err(|e| e.to_string())?;
        if data.code != 0 {
            return Err(format!("reply failed: {} {}", data.code, data.msg));
        }
        Ok(())
    }
}
