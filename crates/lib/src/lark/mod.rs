//! Lark platform boundary.
//!
//! Event payload types for the webhook side and the Open API client for the
//! reply side. The core only sees decoded [`MessageEvent`]s; signature and
//! transport concerns stay in the server module.

mod client;
mod event;

pub use client::{LarkClient, ReplySender};
pub use event::{
    ChatType, EventEnvelope, Mention, MessageEvent, MESSAGE_RECEIVE_EVENT,
};
