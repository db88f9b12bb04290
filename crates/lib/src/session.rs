//! Per-(chat, sender) session: conversation-continuation state and the
//! processing loop that consumes the session's inbox.
//!
//! One loop per session, spawned exactly once by the handler. The loop is
//! the only writer of the continuation identifiers, so a session never races
//! with itself; events within a session are handled strictly in arrival
//! order while other sessions make progress independently.

use crate::extract::extract_text;
use crate::filter::KeywordFilter;
use crate::lark::{ChatType, MessageEvent, ReplySender};
use crate::upstream::Upstream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Composite session key. Each distinct sender in a group chat gets its own
/// backend conversation even though replies land in the same chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub chat_id: String,
    pub sender_id: String,
}

impl SessionKey {
    pub fn from_event(event: &MessageEvent) -> Self {
        Self {
            chat_id: event.message.chat_id.clone(),
            sender_id: event.sender.sender_id.open_id.clone(),
        }
    }
}

/// Collaborators shared by every session, owned by the handler.
pub struct SessionContext {
    pub upstream: Arc<dyn Upstream>,
    pub replies: Arc<dyn ReplySender>,
    pub filter: Arc<KeywordFilter>,
    /// Minimum spacing before each dequeued message is processed.
    pub throttle: Duration,
    /// Reply template for malformed inbound content.
    pub extract_failed: String,
    /// Reply template for transport or backend-signaled upstream failures.
    pub upstream_failed: String,
}

/// One session's state. The continuation pair starts empty and is updated
/// only after a fully successful backend turn.
pub struct Session {
    key: SessionKey,
    ctx: Arc<SessionContext>,
    conversation_id: String,
    last_message_id: String,
}

impl Session {
    pub fn new(key: SessionKey, ctx: Arc<SessionContext>) -> Self {
        Self {
            key,
            ctx,
            conversation_id: String::new(),
            last_message_id: String::new(),
        }
    }

    /// Consume the inbox until the process exits (or every sender is
    /// dropped). Per event: throttle, extract, query, filter, reply.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<MessageEvent>) {
        log::info!(
            "session started for chat {} sender {}",
            self.key.chat_id,
            self.key.sender_id
        );
        while let Some(event) = inbox.recv().await {
            tokio::time::sleep(self.ctx.throttle).await;

            let text = match extract_text(&event.message.content) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("extract text failed: {}", e);
                    let reply = self.ctx.extract_failed.clone();
                    self.reply(&reply, &event).await;
                    continue;
                }
            };

            let response = match self
                .ctx
                .upstream
                .ask(&text, &self.conversation_id, &self.last_message_id)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("upstream ask failed: {}", e);
                    let reply = self.ctx.upstream_failed.clone();
                    self.reply(&reply, &event).await;
                    continue;
                }
            };
            if !response.error.is_empty() {
                // Backend answered but signalled its own failure; treat the
                // same as a transport error and leave continuation untouched.
                log::warn!("upstream returned error: {}", response.error);
                let reply = self.ctx.upstream_failed.clone();
                self.reply(&reply, &event).await;
                continue;
            }

            // Continuation ids are updated before the reply is built, and
            // only ever here.
            self.last_message_id = response.response_id;
            self.conversation_id = response.conversation_id;
            log::debug!(
                "session {}: conversation {} last message {}",
                self.key.chat_id,
                self.conversation_id,
                self.last_message_id
            );

            let reply = self.ctx.filter.apply(&response.content);
            self.reply(&reply, &event).await;
        }
        log::info!(
            "session inbox closed for chat {} sender {}",
            self.key.chat_id,
            self.key.sender_id
        );
    }

    /// Send a reply to the originating message. In a group chat the sender
    /// is tagged so concurrent per-sender sessions stay visibly attributed.
    /// Delivery failures are logged only.
    async fn reply(&self, text: &str, event: &MessageEvent) {
        let text = if event.chat_type() == ChatType::Group {
            format!(
                "<at user_id=\"{}\"></at> {}",
                event.sender.sender_id.open_id, text
            )
        } else {
            text.to_string()
        };
        if let Err(e) = self
            .ctx
            .replies
            .reply(&event.message.message_id, &text)
            .await
        {
            log::warn!("send reply failed: {}", e);
        }
    }
}
