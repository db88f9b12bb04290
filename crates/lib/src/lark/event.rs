//! Lark webhook event payloads (schema 2.0 envelope).

use serde::Deserialize;

/// Event type header value for inbound messages.
pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

/// Outer envelope of a v2 webhook event POST.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub header: EventHeader,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventHeader {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub token: String,
}

/// Kind of chat an event came from. Lark sends "p2p" for direct chats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Direct,
    Group,
    Other,
}

/// Decoded `im.message.receive_v1` event, flattened to the fields the relay
/// needs. Immutable once received.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    pub sender: EventSender,
    pub message: EventMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSender {
    pub sender_id: SenderId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderId {
    #[serde(default)]
    pub open_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub message_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub chat_type: String,
    #[serde(default)]
    pub message_type: String,
    /// Raw content payload; a JSON string like `{"text":"..."}`.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

/// A mentioned participant; the name is what the admission check compares
/// against the bot's display name.
#[derive(Debug, Clone, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub name: String,
}

impl MessageEvent {
    pub fn chat_type(&self) -> ChatType {
        match self.message.chat_type.as_str() {
            "p2p" => ChatType::Direct,
            "group" => ChatType::Group,
            _ => ChatType::Other,
        }
    }
}
