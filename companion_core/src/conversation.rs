//! Conversation state container.
//!
//! `ConversationStore` is the single owner of the message log. Everything
//! outside the store observes it through [`ConversationStore::snapshot`] copies,
//! so a reader never sees a half-applied mutation from a concurrent generation.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::CoreError;
use crate::message::Message;

/// Ordered message log plus the active prompt and character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub character: String,
}

impl ConversationState {
    /// Messages after the leading system message.
    pub fn tail(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.is_system() => &self.messages[1..],
            _ => &self.messages,
        }
    }
}

pub struct ConversationStore {
    state: Mutex<ConversationState>,
}

impl ConversationStore {
    pub fn new(system_prompt: impl Into<String>, character: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            state: Mutex::new(ConversationState {
                messages: vec![Message::system(system_prompt.clone())],
                system_prompt,
                character: character.into(),
            }),
        }
    }

    // The state is plain data; a panic mid-mutation cannot leave it
    // half-written, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message at the end of the log.
    ///
    /// A system message is only accepted as the very first entry.
    pub fn append(&self, message: Message) -> Result<(), CoreError> {
        let mut state = self.lock();
        if message.is_system() && !state.messages.is_empty() {
            return Err(CoreError::InvariantViolation(format!(
                "system message appended at position {}",
                state.messages.len()
            )));
        }
        state.messages.push(message);
        Ok(())
    }

    /// Overwrite the leading system message, inserting one if missing.
    pub fn replace_system_prompt(&self, text: impl Into<String>) {
        let text = text.into();
        let mut state = self.lock();
        state.system_prompt = text.clone();
        match state.messages.first_mut() {
            Some(first) if first.is_system() => first.content = text,
            _ => state.messages.insert(0, Message::system(text)),
        }
    }

    pub fn snapshot(&self) -> ConversationState {
        self.lock().clone()
    }

    /// Replace the whole log with a single system message.
    pub fn reset(&self, system_prompt: impl Into<String>) {
        let system_prompt = system_prompt.into();
        let mut state = self.lock();
        state.messages = vec![Message::system(system_prompt.clone())];
        state.system_prompt = system_prompt;
    }

    pub fn set_character(&self, character: impl Into<String>) {
        self.lock().character = character.into();
    }

    pub fn character(&self) -> String {
        self.lock().character.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.lock().system_prompt.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }
}
