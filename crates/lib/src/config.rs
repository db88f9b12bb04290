//! Configuration types and loading.
//!
//! Config is loaded once at startup from a JSON file (e.g.
//! `~/.larkgpt/config.json`) and environment. No hot reload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Webhook listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bot identity.
    #[serde(default)]
    pub bot: BotConfig,

    /// Lark Open API credentials and webhook verification.
    #[serde(default)]
    pub lark: LarkConfig,

    /// Upstream ChatGPT backend settings.
    #[serde(default)]
    pub chatgpt: ChatGptConfig,

    /// Reply templates and pipeline tuning.
    #[serde(default)]
    pub messages: MessagesConfig,

    /// Keyword filter: trigger phrase -> replacement candidates.
    #[serde(default)]
    pub filter: HashMap<String, Vec<String>>,
}

/// Webhook listener bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address (default "0.0.0.0" — Lark must be able to reach us).
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Port for webhook POSTs (default 9999).
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    9999
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            port: default_server_port(),
        }
    }
}

/// Bot identity: the display name used for group-chat mention admission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Display name as it appears in Lark mentions. Required.
    #[serde(default)]
    pub name: String,
}

/// Lark Open API app credentials and webhook verification token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LarkConfig {
    /// App ID from the Lark developer console. Required.
    #[serde(default)]
    pub app_id: String,

    /// App secret. Overridden by LARK_APP_SECRET env when set. Required.
    #[serde(default)]
    pub app_secret: String,

    /// Webhook verification token. When set, event headers must carry it.
    pub verify_token: Option<String>,

    /// Encrypt key from the console. Payload decryption is out of scope;
    /// the field is accepted so the console config can be mirrored as-is.
    pub encrypt_key: Option<String>,
}

/// Upstream ChatGPT backend: host, bearer credential, request timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGptConfig {
    /// Backend base URL, e.g. "http://127.0.0.1:5000". Required.
    #[serde(default)]
    pub host: String,

    /// Bearer credential. Overridden by CHATGPT_TOKEN env when set. Required.
    #[serde(default)]
    pub token: String,

    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_chatgpt_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_chatgpt_timeout_secs() -> u64 {
    30
}

impl Default for ChatGptConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            timeout_secs: default_chatgpt_timeout_secs(),
        }
    }
}

/// Fixed reply templates for per-message failure modes, plus pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesConfig {
    /// Sent when the inbound message body cannot be parsed.
    #[serde(default = "default_extract_failed")]
    pub extract_failed: String,

    /// Sent when the upstream backend fails (transport or backend error).
    #[serde(default = "default_upstream_failed")]
    pub upstream_failed: String,

    /// Minimum spacing before each dequeued message is processed (default 1).
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,

    /// Per-session inbox capacity; a full inbox suspends the submitter
    /// (default 1000).
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_extract_failed() -> String {
    "sorry, I could not read that message.".to_string()
}

fn default_upstream_failed() -> String {
    "sorry, something went wrong talking to the model. please try again.".to_string()
}

fn default_throttle_secs() -> u64 {
    1
}

fn default_inbox_capacity() -> usize {
    1000
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            extract_failed: default_extract_failed(),
            upstream_failed: default_upstream_failed(),
            throttle_secs: default_throttle_secs(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Resolve the Lark app secret: env LARK_APP_SECRET overrides config.
pub fn resolve_lark_app_secret(config: &Config) -> Option<String> {
    nonempty_env("LARK_APP_SECRET").or_else(|| nonempty(&config.lark.app_secret))
}

/// Resolve the ChatGPT bearer token: env CHATGPT_TOKEN overrides config.
pub fn resolve_chatgpt_token(config: &Config) -> Option<String> {
    nonempty_env("CHATGPT_TOKEN").or_else(|| nonempty(&config.chatgpt.token))
}

fn nonempty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| nonempty(&s))
}

fn nonempty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve config path from env or default (`~/.larkgpt/config.json`).
pub fn default_config_path() -> PathBuf {
    std::env::var("LARKGPT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".larkgpt").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => error;
/// the bot cannot serve traffic without credentials.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let config: Config = serde_json::from_str(&s)
        .with_context(|| format!("parsing config from {}", path.display()))?;
    Ok((config, path))
}

/// Check that everything required to serve traffic is present.
/// Called before the listener binds; a failure here is fatal.
pub fn validate(config: &Config) -> Result<()> {
    if config.bot.name.trim().is_empty() {
        anyhow::bail!("bot.name is required (group mention admission needs it)");
    }
    if config.lark.app_id.trim().is_empty() {
        anyhow::bail!("lark.appId is required");
    }
    if resolve_lark_app_secret(config).is_none() {
        anyhow::bail!("lark.appSecret (or LARK_APP_SECRET) is required");
    }
    if config.chatgpt.host.trim().is_empty() {
        anyhow::bail!("chatgpt.host is required");
    }
    if resolve_chatgpt_token(config).is_none() {
        anyhow::bail!("chatgpt.token (or CHATGPT_TOKEN) is required");
    }
    if config.messages.inbox_capacity == 0 {
        anyhow::bail!("messages.inboxCapacity must be at least 1");
    }
    Ok(())
}

/// Write a default config file for `larkgpt init`; refuses to overwrite.
pub fn write_default_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("config already exists at {}", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let config = Config::default();
    let s = serde_json::to_string_pretty(&config).context("serializing default config")?;
    std::fs::write(path, s)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(())
}
