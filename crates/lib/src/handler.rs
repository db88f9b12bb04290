//! Session registry: the single entry point for inbound message events.
//!
//! Decides admissibility, owns the session map, and guarantees that each
//! session key has exactly one processing loop. The map mutex covers the
//! whole check-insert-spawn sequence so a submit race cannot start two loops
//! for the same key.

use crate::config::{Config, MessagesConfig};
use crate::filter::KeywordFilter;
use crate::lark::{ChatType, MessageEvent, ReplySender};
use crate::session::{Session, SessionContext, SessionKey};
use crate::upstream::Upstream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Receives every admitted event and routes it to its session's inbox,
/// creating the session on first contact.
pub struct MessageHandler {
    bot_name: String,
    inbox_capacity: usize,
    ctx: Arc<SessionContext>,
    sessions: Mutex<HashMap<SessionKey, mpsc::Sender<MessageEvent>>>,
}

impl MessageHandler {
    pub fn new(
        bot_name: String,
        messages: &MessagesConfig,
        upstream: Arc<dyn Upstream>,
        replies: Arc<dyn ReplySender>,
        filter: Arc<KeywordFilter>,
    ) -> Self {
        let ctx = Arc::new(SessionContext {
            upstream,
            replies,
            filter,
            throttle: Duration::from_secs(messages.throttle_secs),
            extract_failed: messages.extract_failed.clone(),
            upstream_failed: messages.upstream_failed.clone(),
        });
        Self {
            bot_name,
            inbox_capacity: messages.inbox_capacity.max(1),
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Build a handler with the given collaborators from config.
    pub fn from_config(
        config: &Config,
        upstream: Arc<dyn Upstream>,
        replies: Arc<dyn ReplySender>,
    ) -> Self {
        let filter = Arc::new(KeywordFilter::new(config.filter.clone()));
        Self::new(
            config.bot.name.clone(),
            &config.messages,
            upstream,
            replies,
            filter,
        )
    }

    /// Handle one inbound event. Inadmissible events are dropped silently;
    /// admitted events are enqueued onto their session's inbox, creating the
    /// session and starting its loop on first contact. A full inbox suspends
    /// this call until the loop drains (bounded back-pressure, never
    /// unbounded memory growth).
    pub async fn submit(&self, event: MessageEvent) {
        if !self.admits(&event) {
            log::debug!(
                "dropping event in chat {} (not admitted)",
                event.message.chat_id
            );
            return;
        }
        let key = SessionKey::from_event(&event);
        let tx = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(self.inbox_capacity);
                    let session = Session::new(key.clone(), self.ctx.clone());
                    tokio::spawn(session.run(rx));
                    sessions.insert(key, tx.clone());
                    tx
                }
            }
        };
        if tx.send(event).await.is_err() {
            log::warn!("session inbox closed, event dropped");
        }
    }

    /// Admission rule: direct chats always; group chats only when the bot is
    /// the single mentioned participant; anything else never.
    fn admits(&self, event: &MessageEvent) -> bool {
        match event.chat_type() {
            ChatType::Direct => true,
            ChatType::Group => {
                if event.message.mentions.len() != 1 {
                    return false;
                }
                event.message.mentions[0].name == self.bot_name
            }
            ChatType::Other => false,
        }
    }

    /// Number of live sessions (for tests and introspection).
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
