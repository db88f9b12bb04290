//! Text extraction from inbound Lark message content.
//!
//! A text message's `content` field is a JSON string like
//! `{"text":"@_user_1 hi"}`; mentions are flattened to a fixed placeholder
//! which we strip before forwarding to the backend.

use serde::Deserialize;

/// Placeholder Lark substitutes for a mention inside the text body.
const MENTION_PLACEHOLDER: &str = "@_user_1";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("invalid message content: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    text: String,
}

/// Parse the raw message content and return the plain text with mention
/// placeholders and surrounding whitespace removed.
pub fn extract_text(raw: &str) -> Result<String, ExtractError> {
    let content: TextContent = serde_json::from_str(raw)?;
    let text = content.text.replace(MENTION_PLACEHOLDER, "");
    Ok(text.trim().to_string())
}
