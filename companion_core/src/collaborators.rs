//! Interfaces the core consumes from the outside world.
//!
//! Network-bound collaborators are async; local storage ones are plain
//! synchronous calls, matching how the rest of the crate talks to sqlite and
//! the filesystem.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Prefix used by [`UrlFetch`] implementations when a page could not be read.
pub const FETCH_ERROR_PREFIX: &str = "[ERROR]";

/// Loads character prompt text by character id.
pub trait PromptLoader: Send + Sync {
    fn load(&self, character: &str) -> Option<String>;

    fn list_characters(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Long-term memory facts, keyed by character.
pub trait MemoryStore: Send + Sync {
    /// Facts in insertion order.
    fn load_facts(&self, character: &str) -> Result<Vec<String>>;
    /// Adds a fact. Exact duplicates are ignored.
    fn add_fact(&self, character: &str, fact: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub snippet: String,
    pub source: String,
}

impl SearchHit {
    pub fn note_line(&self) -> String {
        format!("{} (Source: {})", self.snippet, self.source)
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Whether credentials are present. An unconfigured search is never called.
    fn is_configured(&self) -> bool;

    /// Never fails: any error yields an empty list.
    async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit>;
}

#[async_trait]
pub trait UrlFetch: Send + Sync {
    /// Cleaned page text, at most `max_chars` characters plus an ellipsis.
    /// Failures come back as text starting with [`FETCH_ERROR_PREFIX`].
    async fn fetch(&self, url: &str, max_chars: usize) -> String;
}

/// Append-only transcript log.
pub trait ChatLog: Send + Sync {
    fn record(&self, timestamp: &str, role: &str, text: &str) -> Result<()>;
}

/// Best-effort user notification. Implementations swallow their own failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, text: &str);
}

/// Per-character conversation persistence.
pub trait HistoryStore: Send + Sync {
    fn save_history(&self, messages: &[Message], character: &str) -> Result<()>;
    /// Empty when nothing was saved or the saved file is unreadable.
    fn load_history(&self, character: &str) -> Vec<Message>;
}
