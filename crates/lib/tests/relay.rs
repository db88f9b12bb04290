//! Behavior tests for the session registry and per-session pipeline, using
//! mock upstream and reply boundaries. No network required.

use async_trait::async_trait;
use lib::config::MessagesConfig;
use lib::filter::KeywordFilter;
use lib::handler::MessageHandler;
use lib::lark::{MessageEvent, ReplySender};
use lib::upstream::{AskResponse, Upstream, UpstreamError};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One scripted upstream turn.
enum Turn {
    Ok(AskResponse),
    TransportErr,
}

fn ok_turn(conversation_id: &str, response_id: &str, content: &str) -> Turn {
    Turn::Ok(AskResponse {
        conversation_id: conversation_id.to_string(),
        response_id: response_id.to_string(),
        content: content.to_string(),
        error: String::new(),
    })
}

/// Upstream mock: records (text, conversation_id, parent_id) per call and
/// plays back scripted turns in order.
struct ScriptedUpstream {
    calls: Mutex<Vec<(String, String, String)>>,
    turns: Mutex<VecDeque<Turn>>,
    /// When set, every call waits here first (for serialization tests).
    gate: Option<Arc<Notify>>,
}

impl ScriptedUpstream {
    fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            turns: Mutex::new(turns.into()),
            gate: None,
        })
    }

    fn gated(turns: Vec<Turn>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            turns: Mutex::new(turns.into()),
            gate: Some(gate),
        })
    }

    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn ask(
        &self,
        text: &str,
        conversation_id: &str,
        last_message_id: &str,
    ) -> Result<AskResponse, UpstreamError> {
        self.calls.lock().expect("calls lock").push((
            text.to_string(),
            conversation_id.to_string(),
            last_message_id.to_string(),
        ));
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        let turn = self.turns.lock().expect("turns lock").pop_front();
        match turn {
            Some(Turn::Ok(resp)) => Ok(resp),
            Some(Turn::TransportErr) => Err(UpstreamError::Api("503 unavailable".to_string())),
            None => Ok(AskResponse {
                conversation_id: "c-default".to_string(),
                response_id: "r-default".to_string(),
                content: format!("echo: {text}"),
                error: String::new(),
            }),
        }
    }
}

/// Reply mock: forwards (message_id, text) pairs to the test over a channel.
struct ChannelSender {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl ChannelSender {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReplySender for ChannelSender {
    async fn reply(&self, message_id: &str, text: &str) -> Result<(), String> {
        self.tx
            .send((message_id.to_string(), text.to_string()))
            .map_err(|e| e.to_string())
    }
}

fn make_handler(
    upstream: Arc<dyn Upstream>,
    replies: Arc<dyn ReplySender>,
    filter: HashMap<String, Vec<String>>,
) -> MessageHandler {
    let messages = MessagesConfig {
        throttle_secs: 0,
        ..MessagesConfig::default()
    };
    MessageHandler::new(
        "Tom".to_string(),
        &messages,
        upstream,
        replies,
        Arc::new(KeywordFilter::new(filter)),
    )
}

fn event(
    chat_type: &str,
    chat_id: &str,
    sender: &str,
    message_id: &str,
    text: &str,
    mentions: &[&str],
) -> MessageEvent {
    let mentions: Vec<_> = mentions.iter().map(|n| json!({ "name": n })).collect();
    serde_json::from_value(json!({
        "sender": { "sender_id": { "open_id": sender } },
        "message": {
            "message_id": message_id,
            "chat_id": chat_id,
            "chat_type": chat_type,
            "message_type": "text",
            "content": json!({ "text": text }).to_string(),
            "mentions": mentions,
        }
    }))
    .expect("build event")
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("reply within timeout")
        .expect("reply channel open")
}

#[tokio::test]
async fn direct_chat_is_always_admitted() {
    let upstream = ScriptedUpstream::new(vec![ok_turn("c1", "r1", "hello back")]);
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "hello", &[]))
        .await;

    let (message_id, text) = next_reply(&mut rx).await;
    assert_eq!(message_id, "om_1");
    assert_eq!(text, "hello back");
    assert_eq!(handler.session_count().await, 1);
}

#[tokio::test]
async fn group_chat_requires_exactly_one_mention_of_the_bot() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let (replies, _rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());

    // No mentions.
    handler
        .submit(event("group", "oc_1", "ou_1", "om_1", "hi", &[]))
        .await;
    // Two mentions, one of them the bot.
    handler
        .submit(event("group", "oc_1", "ou_1", "om_2", "hi", &["Tom", "Ann"]))
        .await;
    // One mention, wrong name.
    handler
        .submit(event("group", "oc_1", "ou_1", "om_3", "hi", &["Ann"]))
        .await;
    // Unknown chat type.
    handler
        .submit(event("topic", "oc_1", "ou_1", "om_4", "hi", &["Tom"]))
        .await;

    assert_eq!(handler.session_count().await, 0);
    assert!(upstream.calls().is_empty());

    // One mention naming the bot: admitted.
    handler
        .submit(event("group", "oc_1", "ou_1", "om_5", "hi", &["Tom"]))
        .await;
    assert_eq!(handler.session_count().await, 1);
}

#[tokio::test]
async fn group_reply_tags_the_original_sender() {
    let upstream = ScriptedUpstream::new(vec![ok_turn("c1", "r1", "answer")]);
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream, replies, HashMap::new());

    handler
        .submit(event("group", "oc_1", "ou_7", "om_1", "@_user_1 hi", &["Tom"]))
        .await;

    let (_, text) = next_reply(&mut rx).await;
    assert_eq!(text, "<at user_id=\"ou_7\"></at> answer");
}

#[tokio::test]
async fn one_session_per_key_with_fifo_continuation() {
    let upstream = ScriptedUpstream::new(vec![
        ok_turn("c1", "r1", "first answer"),
        ok_turn("c1", "r2", "second answer"),
    ]);
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "one", &[]))
        .await;
    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_2", "two", &[]))
        .await;

    let (_, first) = next_reply(&mut rx).await;
    let (_, second) = next_reply(&mut rx).await;
    assert_eq!(first, "first answer");
    assert_eq!(second, "second answer");
    assert_eq!(handler.session_count().await, 1);

    let calls = upstream.calls();
    assert_eq!(calls.len(), 2);
    // First turn starts with empty continuation ids.
    assert_eq!(calls[0], ("one".to_string(), String::new(), String::new()));
    // Second turn threads the ids from the first response.
    assert_eq!(
        calls[1],
        ("two".to_string(), "c1".to_string(), "r1".to_string())
    );
}

#[tokio::test]
async fn distinct_senders_in_one_chat_get_separate_sessions() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream, replies, HashMap::new());

    handler
        .submit(event("group", "oc_1", "ou_1", "om_1", "hi", &["Tom"]))
        .await;
    handler
        .submit(event("group", "oc_1", "ou_2", "om_2", "hi", &["Tom"]))
        .await;

    let _ = next_reply(&mut rx).await;
    let _ = next_reply(&mut rx).await;
    assert_eq!(handler.session_count().await, 2);
}

#[tokio::test]
async fn failed_turn_replies_with_template_and_keeps_continuation() {
    let upstream = ScriptedUpstream::new(vec![
        ok_turn("c1", "r1", "ok"),
        Turn::TransportErr,
        ok_turn("c2", "r2", "back"),
    ]);
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());
    let template = MessagesConfig::default().upstream_failed;

    for (id, text) in [("om_1", "a"), ("om_2", "b"), ("om_3", "c")] {
        handler
            .submit(event("p2p", "oc_1", "ou_1", id, text, &[]))
            .await;
    }

    let (_, ok_reply) = next_reply(&mut rx).await;
    let (_, failed_reply) = next_reply(&mut rx).await;
    let (_, recovered_reply) = next_reply(&mut rx).await;
    assert_eq!(ok_reply, "ok");
    assert_eq!(failed_reply, template);
    assert_eq!(recovered_reply, "back");

    // The failed turn must not have touched the continuation ids: the third
    // call still carries the first turn's ids.
    let calls = upstream.calls();
    assert_eq!(calls[2].1, "c1");
    assert_eq!(calls[2].2, "r1");
}

#[tokio::test]
async fn backend_error_field_is_treated_as_a_failed_turn() {
    let upstream = ScriptedUpstream::new(vec![
        Turn::Ok(AskResponse {
            conversation_id: "cx".to_string(),
            response_id: "rx".to_string(),
            content: String::new(),
            error: "model overloaded".to_string(),
        }),
        ok_turn("c1", "r1", "fine now"),
    ]);
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());
    let template = MessagesConfig::default().upstream_failed;

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "a", &[]))
        .await;
    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_2", "b", &[]))
        .await;

    let (_, failed_reply) = next_reply(&mut rx).await;
    assert_eq!(failed_reply, template);
    let _ = next_reply(&mut rx).await;

    // The errored response's ids were discarded.
    let calls = upstream.calls();
    assert_eq!(calls[1].1, "");
    assert_eq!(calls[1].2, "");
}

#[tokio::test]
async fn malformed_content_replies_with_extract_template_without_querying() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());
    let template = MessagesConfig::default().extract_failed;

    let mut bad = event("p2p", "oc_1", "ou_1", "om_1", "x", &[]);
    bad.message.content = "not json".to_string();
    handler.submit(bad).await;

    let (_, text) = next_reply(&mut rx).await;
    assert_eq!(text, template);
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn reply_text_passes_through_the_keyword_filter() {
    let upstream = ScriptedUpstream::new(vec![ok_turn("c1", "r1", "please Refund me")]);
    let (replies, mut rx) = ChannelSender::new();
    let mut filter = HashMap::new();
    filter.insert("refund".to_string(), vec!["see FAQ".to_string()]);
    let handler = make_handler(upstream, replies, filter);

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "hi", &[]))
        .await;

    let (_, text) = next_reply(&mut rx).await;
    assert_eq!(text, "see FAQ");
}

#[tokio::test]
async fn second_event_waits_for_the_first_pipeline_to_finish() {
    let gate = Arc::new(Notify::new());
    let upstream = ScriptedUpstream::gated(
        vec![ok_turn("c1", "r1", "first"), ok_turn("c1", "r2", "second")],
        gate.clone(),
    );
    let (replies, mut rx) = ChannelSender::new();
    let handler = make_handler(upstream.clone(), replies, HashMap::new());

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "one", &[]))
        .await;
    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_2", "two", &[]))
        .await;

    // Give the loop time to reach the gated upstream call; the second event
    // must still be queued behind the first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.calls().len(), 1);
    assert!(rx.try_recv().is_err());

    gate.notify_one();
    let (_, first) = next_reply(&mut rx).await;
    assert_eq!(first, "first");

    gate.notify_one();
    let (_, second) = next_reply(&mut rx).await;
    assert_eq!(second, "second");
    assert_eq!(upstream.calls().len(), 2);
}

#[tokio::test]
async fn full_inbox_suspends_the_submitter_until_the_loop_drains() {
    let gate = Arc::new(Notify::new());
    let upstream = ScriptedUpstream::gated(Vec::new(), gate.clone());
    let (replies, mut rx) = ChannelSender::new();
    let messages = MessagesConfig {
        throttle_secs: 0,
        inbox_capacity: 1,
        ..MessagesConfig::default()
    };
    let handler = Arc::new(MessageHandler::new(
        "Tom".to_string(),
        &messages,
        upstream.clone(),
        replies,
        Arc::new(KeywordFilter::new(HashMap::new())),
    ));

    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_1", "one", &[]))
        .await;
    // Let the loop dequeue the first event and park at the gated upstream
    // call, so the next event occupies the single inbox slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.calls().len(), 1);
    handler
        .submit(event("p2p", "oc_1", "ou_1", "om_2", "two", &[]))
        .await;

    // The inbox is now full: a third submit must suspend, not drop or fail.
    let blocked = {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler
                .submit(event("p2p", "oc_1", "ou_1", "om_3", "three", &[]))
                .await;
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    // Draining the first event frees the slot and releases the submitter.
    gate.notify_one();
    let (_, first) = next_reply(&mut rx).await;
    assert_eq!(first, "echo: one");
    timeout(RECV_TIMEOUT, blocked)
        .await
        .expect("third submit completes after the loop drains")
        .expect("submit task");

    gate.notify_one();
    let (_, second) = next_reply(&mut rx).await;
    assert_eq!(second, "echo: two");
    gate.notify_one();
    let (_, third) = next_reply(&mut rx).await;
    assert_eq!(third, "echo: three");
    assert_eq!(upstream.calls().len(), 3);
    assert_eq!(handler.session_count().await, 1);
}

#[tokio::test]
async fn concurrent_submits_for_one_key_create_one_session() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let (replies, mut rx) = ChannelSender::new();
    let handler = Arc::new(make_handler(upstream.clone(), replies, HashMap::new()));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            handler
                .submit(event(
                    "p2p",
                    "oc_1",
                    "ou_1",
                    &format!("om_{i}"),
                    &format!("msg {i}"),
                    &[],
                ))
                .await;
        }));
    }
    for t in tasks {
        t.await.expect("submit task");
    }

    for _ in 0..8 {
        let _ = next_reply(&mut rx).await;
    }
    assert_eq!(handler.session_count().await, 1);
    assert_eq!(upstream.calls().len(), 8);
}
