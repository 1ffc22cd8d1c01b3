//! Conversation orchestration core for a local companion chat.
//!
//! The engine mediates between the user, a local text-generation backend and
//! a handful of context sources (long-term memory, web search, URL fetch).
//! It owns the conversation log, serializes every generation through a single
//! exclusive resource, and recovers from backends that return empty output.

pub mod chat_log;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod generation;
pub mod history;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod message;
pub mod notify;
pub mod proactive;
pub mod prompts;
pub mod runtime;
pub mod scheduler;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::CoreError;
pub use message::{Message, Role};
