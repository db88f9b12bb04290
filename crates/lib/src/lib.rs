//! larkgpt core library — config, Lark boundary, keyword filter, upstream
//! client, and the per-(chat, sender) session pipeline used by the CLI.

pub mod config;
pub mod extract;
pub mod filter;
pub mod handler;
pub mod lark;
pub mod server;
pub mod session;
pub mod upstream;
