//! Serializes every generation through one exclusive resource.
//!
//! User turns wait for the resource; proactive turns only try it and are
//! skipped when it is held. Store mutations happen only while the resource is
//! held, so the context a backend saw always matches what is appended after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use flume::Sender;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chat_log::timestamp_now;
use crate::collaborators::{ChatLog, HistoryStore};
use crate::context::ContextAssembler;
use crate::conversation::{ConversationState, ConversationStore};
use crate::error::CoreError;
use crate::events::EngineEvent;
use crate::generation::{GenerationInvoker, GenerationParams, GenerationResult, RETRY_INDICATOR};
use crate::message::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    User,
    Proactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Generating,
}

/// Immutable description of one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub trigger: Trigger,
    pub target_messages: ConversationState,
    pub parameters: GenerationParams,
}

impl GenerationRequest {
    fn new(trigger: Trigger, target_messages: ConversationState, parameters: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            target_messages,
            parameters,
        }
    }
}

/// What a user turn produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub request_id: Uuid,
    pub result: GenerationResult,
    pub notices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProactiveAttempt {
    /// Another generation held the resource.
    Busy,
    /// The processing flag was already raised after acquiring the resource.
    Abandoned,
    /// The backend replied with something not worth showing.
    Filtered,
    Failed(CoreError),
    Delivered { character: String, text: String },
}

pub struct GenerationScheduler {
    store: Arc<ConversationStore>,
    assembler: ContextAssembler,
    invoker: GenerationInvoker,
    chat_log: Arc<dyn ChatLog>,
    history: Arc<dyn HistoryStore>,
    event_tx: Sender<EngineEvent>,
    generation_lock: Mutex<()>,
    is_processing: AtomicBool,
}

/// Raises `is_processing` for its lifetime.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
    event_tx: &'a Sender<EngineEvent>,
}

impl<'a> ProcessingGuard<'a> {
    fn enter(flag: &'a AtomicBool, event_tx: &'a Sender<EngineEvent>) -> Self {
        flag.store(true, Ordering::SeqCst);
        let _ = event_tx.send(EngineEvent::StateChanged(SchedulerState::Generating));
        Self { flag, event_tx }
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        let _ = self
            .event_tx
            .send(EngineEvent::StateChanged(SchedulerState::Idle));
    }
}

impl GenerationScheduler {
    pub fn new(
        store: Arc<ConversationStore>,
        assembler: ContextAssembler,
        invoker: GenerationInvoker,
        chat_log: Arc<dyn ChatLog>,
        history: Arc<dyn HistoryStore>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            assembler,
            invoker,
            chat_log,
            history,
            event_tx,
            generation_lock: Mutex::new(()),
            is_processing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn model_name(&self) -> String {
        self.invoker.model_name()
    }

    /// Run `f` while holding the generation resource.
    pub async fn exclusive<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        let _resource = self.generation_lock.lock().await;
        f(&self.store)
    }

    /// Append `message` and generate a reply, waiting for the resource.
    ///
    /// Generation failures come back inside the report. `Err` is reserved for
    /// store invariant violations.
    pub async fn submit_user(
        &self,
        message: Message,
        params: GenerationParams,
    ) -> Result<TurnReport, CoreError> {
        if message.role != Role::User {
            return Err(CoreError::InvariantViolation(format!(
                "user submission carried a {} message",
                message.role
            )));
        }

        let _resource = self.generation_lock.lock().await;
        let _processing = ProcessingGuard::enter(&self.is_processing, &self.event_tx);

        self.store.append(message)?;
        let request = GenerationRequest::new(Trigger::User, self.store.snapshot(), params);
        tracing::debug!(
            "Generation {} started for '{}' ({} messages)",
            request.id,
            request.target_messages.character,
            request.target_messages.messages.len()
        );

        let context = self
            .assembler
            .assemble(&request.target_messages, params.prompt_format, Local::now())
            .await?;
        for notice in &context.notices {
            self.emit_notice(notice);
        }
        for degraded in &context.degraded {
            tracing::warn!("Generation {} continues without: {}", request.id, degraded);
        }

        let result = self.invoker.invoke(&context.messages, &params).await;
        self.complete(&request, &result)?;

        Ok(TurnReport {
            request_id: request.id,
            result,
            notices: context.notices,
        })
    }

    /// Try to run one unprompted turn without waiting for the resource.
    ///
    /// `build` turns the current state into the backend messages; `accept`
    /// decides whether the reply (without the retry indicator) is kept.
    pub async fn submit_proactive(
        &self,
        params: GenerationParams,
        build: impl FnOnce(&ConversationState) -> Vec<Message>,
        accept: impl FnOnce(&str) -> bool,
    ) -> ProactiveAttempt {
        let Ok(_resource) = self.generation_lock.try_lock() else {
            tracing::debug!("Proactive turn skipped: generation in progress");
            return ProactiveAttempt::Busy;
        };
        if self.is_processing() {
            tracing::debug!("Proactive turn abandoned: processing flag already raised");
            return ProactiveAttempt::Abandoned;
        }
        let _processing = ProcessingGuard::enter(&self.is_processing, &self.event_tx);

        let request = GenerationRequest::new(Trigger::Proactive, self.store.snapshot(), params);
        let messages = build(&request.target_messages);
        let result = self.invoker.invoke(&messages, &params).await;

        let text = match (&result.text, &result.error) {
            (Some(text), _) if result.is_success() => text.clone(),
            (_, Some(error)) => return ProactiveAttempt::Failed(error.clone()),
            _ => return ProactiveAttempt::Filtered,
        };
        let visible = text.strip_prefix(RETRY_INDICATOR).unwrap_or(&text).trim();
        if !accept(visible) {
            tracing::debug!(
                "Proactive reply discarded: {}",
                crate::context::truncate_with_ellipsis(visible, 80)
            );
            return ProactiveAttempt::Filtered;
        }

        if let Err(e) = self.complete(&request, &result) {
            return ProactiveAttempt::Failed(e);
        }
        ProactiveAttempt::Delivered {
            character: request.target_messages.character,
            text,
        }
    }

    // Caller holds the generation resource.
    fn complete(&self, request: &GenerationRequest, result: &GenerationResult) -> Result<(), CoreError> {
        let character = &request.target_messages.character;
        match (&result.text, result.is_success()) {
            (Some(text), true) => {
                self.store.append(Message::assistant(text.clone()))?;
                self.record("assistant", text);
                if let Err(e) = self
                    .history
                    .save_history(&self.store.snapshot().messages, character)
                {
                    tracing::warn!("Failed to save history for '{}': {:#}", character, e);
                }
                let _ = self.event_tx.send(EngineEvent::AssistantReply {
                    trigger: request.trigger,
                    text: text.clone(),
                    outcome: result.outcome,
                });
                tracing::debug!("Generation {} completed ({:?})", request.id, result.outcome);
            }
            _ => {
                let message = result
                    .failure_message()
                    .unwrap_or_else(|| "Error: generation failed".to_string());
                tracing::error!("Generation {} failed: {}", request.id, message);
                if request.trigger == Trigger::User {
                    self.emit_notice(&message);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn emit_notice(&self, text: &str) {
        self.record("system", text);
        let _ = self.event_tx.send(EngineEvent::Notice(text.to_string()));
    }

    fn record(&self, role: &str, text: &str) {
        if let Err(e) = self.chat_log.record(&timestamp_now(), role, text) {
            tracing::warn!("Chat log write failed: {:#}", e);
        }
    }
}
