//! Webhook HTTP server: the single inbound path Lark POSTs events to.

use crate::config::{self, Config};
use crate::handler::MessageHandler;
use crate::lark::{self, EventEnvelope, LarkClient, MessageEvent};
use crate::upstream::ChatGptClient;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the webhook route.
#[derive(Clone)]
pub struct ServerState {
    pub handler: Arc<MessageHandler>,
    /// When set, event headers (and verification handshakes) must carry it.
    pub verify_token: Option<String>,
}

/// Body of the endpoint-registration handshake Lark sends when the webhook
/// URL is configured in the console.
#[derive(Debug, Deserialize)]
struct UrlVerification {
    #[serde(rename = "type", default)]
    typ: String,
    #[serde(default)]
    challenge: String,
    #[serde(default)]
    token: String,
}

/// Build the router: one POST path, everything else 404.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/webhook/event", post(webhook_event))
        .with_state(state)
}

/// POST /webhook/event — challenge handshakes are echoed, message events are
/// handed to the session registry, other event types are acknowledged.
async fn webhook_event(State(state): State<ServerState>, body: Bytes) -> Response {
    log::info!("POST /webhook/event");

    if let Ok(v) = serde_json::from_slice::<UrlVerification>(&body) {
        if v.typ == "url_verification" {
            if let Some(ref expected) = state.verify_token {
                if v.token != *expected {
                    return StatusCode::FORBIDDEN.into_response();
                }
            }
            return Json(json!({ "challenge": v.challenge })).into_response();
        }
    }

    let envelope: EventEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("undecodable webhook body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if let Some(ref expected) = state.verify_token {
        if envelope.header.token != *expected {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    if envelope.header.event_type != lark::MESSAGE_RECEIVE_EVENT {
        log::debug!("ignoring event type {}", envelope.header.event_type);
        return StatusCode::OK.into_response();
    }
    let Some(event) = envelope.event else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let event: MessageEvent = match serde_json::from_value(event) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("undecodable message event: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    state.handler.submit(event).await;
    StatusCode::OK.into_response()
}

/// Run the webhook server; binds to config.server.bind:config.server.port.
/// Validates config first — the process must not serve traffic without the
/// bot name and credentials. Blocks until shutdown (Ctrl+C or SIGTERM).
pub async fn run_server(config: Config) -> Result<()> {
    config::validate(&config)?;
    let app_secret =
        config::resolve_lark_app_secret(&config).context("lark app secret missing")?;
    let chatgpt_token =
        config::resolve_chatgpt_token(&config).context("chatgpt token missing")?;

    let upstream = Arc::new(
        ChatGptClient::new(
            &config.chatgpt.host,
            chatgpt_token,
            Duration::from_secs(config.chatgpt.timeout_secs),
        )
        .context("building chatgpt http client")?,
    );
    let replies = Arc::new(LarkClient::new(config.lark.app_id.clone(), app_secret));
    let handler = Arc::new(MessageHandler::from_config(&config, upstream, replies));
    let state = ServerState {
        handler,
        verify_token: config.lark.verify_token.clone(),
    };
    let app = router(state);

    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("webhook server listening on {}", bind_addr);

    // Session loops are not drained on shutdown; process exit terminates them.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server exited")?;
    log::info!("webhook server stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
