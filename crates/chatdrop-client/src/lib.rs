//! Chatdrop Client Library
//!
//! The chat log, its message dispatcher and client configuration.

pub mod chat_log;
pub mod config;
pub mod dispatcher;

pub use chat_log::{ChatLog, ChatLogBuilder, Entry, LogEntry};
pub use dispatcher::{ChatEvent, Dispatcher, Inbound};
