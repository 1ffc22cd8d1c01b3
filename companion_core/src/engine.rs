//! The front-end facing API.
//!
//! `ConversationEngine` owns the store (through the scheduler), the proactive
//! trigger and the collaborators. Every state-replacing operation (restart,
//! clear, import, character switch, manual prompt) runs under the generation
//! resource so it never interleaves with a generation in flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::Sender;
use serde_json::Value;

use crate::chat_log::timestamp_now;
use crate::collaborators::{
    ChatLog, HistoryStore, MemoryStore, Notifier, PromptLoader, UrlFetch, WebSearch,
};
use crate::context::{ContextAssembler, DEFAULT_MEMORY_FACT_LIMIT, DEFAULT_URL_CHAR_BUDGET};
use crate::conversation::{ConversationState, ConversationStore};
use crate::error::CoreError;
use crate::events::EngineEvent;
use crate::generation::{GenerationBackend, GenerationInvoker, GenerationParams};
use crate::history::{export_messages, validate_import, ImportReport};
use crate::message::Message;
use crate::proactive::{ProactiveSettings, ProactiveTrigger};
use crate::prompts::{CharacterProfile, DEFAULT_CHARACTER, DEFAULT_SYSTEM_PROMPT};
use crate::scheduler::{GenerationScheduler, TurnReport};

pub struct EngineCollaborators {
    pub prompts: Arc<dyn PromptLoader>,
    pub memory: Arc<dyn MemoryStore>,
    pub search: Arc<dyn WebSearch>,
    pub fetcher: Arc<dyn UrlFetch>,
    pub chat_log: Arc<dyn ChatLog>,
    pub history: Arc<dyn HistoryStore>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub params: GenerationParams,
    /// Prompt of the built-in assistant.
    pub default_system_prompt: String,
    pub proactive: ProactiveSettings,
    pub proactive_enabled: bool,
    pub memory_fact_limit: usize,
    pub url_char_budget: usize,
    pub generation_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            proactive: ProactiveSettings::default(),
            proactive_enabled: true,
            memory_fact_limit: DEFAULT_MEMORY_FACT_LIMIT,
            url_char_budget: DEFAULT_URL_CHAR_BUDGET,
            generation_timeout: Some(Duration::from_secs(300)),
        }
    }
}

pub struct ConversationEngine {
    scheduler: Arc<GenerationScheduler>,
    trigger: ProactiveTrigger,
    prompts: Arc<dyn PromptLoader>,
    memory: Arc<dyn MemoryStore>,
    chat_log: Arc<dyn ChatLog>,
    history: Arc<dyn HistoryStore>,
    event_tx: Sender<EngineEvent>,
    params: Mutex<GenerationParams>,
    profile: Mutex<CharacterProfile>,
    default_system_prompt: String,
    proactive_enabled: AtomicBool,
}

impl ConversationEngine {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        collaborators: EngineCollaborators,
        settings: EngineSettings,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let profile = CharacterProfile::default_assistant_with(&settings.default_system_prompt);
        let store = Arc::new(ConversationStore::new(
            profile.system_prompt.clone(),
            profile.display_name.clone(),
        ));

        let assembler = ContextAssembler::new(
            collaborators.memory.clone(),
            collaborators.search,
            collaborators.fetcher,
        )
        .with_limits(settings.memory_fact_limit, settings.url_char_budget);

        let mut invoker = GenerationInvoker::new(backend);
        if let Some(deadline) = settings.generation_timeout {
            invoker = invoker.with_deadline(deadline);
        }

        let scheduler = Arc::new(GenerationScheduler::new(
            store,
            assembler,
            invoker,
            collaborators.chat_log.clone(),
            collaborators.history.clone(),
            event_tx.clone(),
        ));
        let trigger = ProactiveTrigger::new(
            scheduler.clone(),
            collaborators.notifier,
            settings.proactive,
        );

        Self {
            scheduler,
            trigger,
            prompts: collaborators.prompts,
            memory: collaborators.memory,
            chat_log: collaborators.chat_log,
            history: collaborators.history,
            event_tx,
            params: Mutex::new(settings.params),
            profile: Mutex::new(profile),
            default_system_prompt: settings.default_system_prompt,
            proactive_enabled: AtomicBool::new(settings.proactive_enabled),
        }
    }

    pub fn snapshot(&self) -> ConversationState {
        self.scheduler.store().snapshot()
    }

    pub fn profile(&self) -> CharacterProfile {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn params(&self) -> GenerationParams {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_params(&self, params: GenerationParams) {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner) = params;
    }

    pub fn model_name(&self) -> String {
        self.scheduler.model_name()
    }

    pub fn is_processing(&self) -> bool {
        self.scheduler.is_processing()
    }

    pub fn is_proactive_enabled(&self) -> bool {
        self.proactive_enabled.load(Ordering::SeqCst)
    }

    pub fn is_proactive_running(&self) -> bool {
        self.trigger.is_running()
    }

    /// The built-in assistant followed by every character with a prompt file.
    pub fn list_characters(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_CHARACTER.to_string()];
        names.extend(
            self.prompts
                .list_characters()
                .into_iter()
                .filter(|name| name != DEFAULT_CHARACTER),
        );
        names
    }

    /// Send one user message and wait for the reply.
    ///
    /// Blank input is ignored and yields `Ok(None)`.
    pub async fn send_user_message(
        &self,
        text: &str,
        image: Option<PathBuf>,
    ) -> Result<Option<TurnReport>, CoreError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let character = self.scheduler.store().character();
        if let Err(e) = self.chat_log.record(&timestamp_now(), "user", text) {
            tracing::warn!("Failed to log user message: {:#}", e);
        }
        if let Err(e) = self.memory.add_fact(&character, text) {
            tracing::warn!("Failed to store memory fact for '{}': {:#}", character, e);
        }

        let message = Message::user(text).with_attachment(image);
        let report = self.scheduler.submit_user(message, self.params()).await?;
        Ok(Some(report))
    }

    pub async fn restart(&self) {
        self.reset_conversation("Chat session restarted.").await;
    }

    pub async fn clear(&self) {
        self.reset_conversation("Chat history cleared.").await;
    }

    async fn reset_conversation(&self, notice: &str) {
        self.scheduler
            .exclusive(|store| store.reset(store.system_prompt()))
            .await;
        let _ = self.event_tx.send(EngineEvent::HistoryReplaced(Vec::new()));
        self.scheduler.emit_notice(notice);
    }

    /// The visible conversation, without system messages.
    pub fn export_history(&self) -> Vec<Message> {
        export_messages(&self.snapshot().messages)
    }

    /// Replace the conversation with the valid subset of `payload`.
    ///
    /// Skipped items are reported as notices and in the returned report. A
    /// payload that is not a list, or that has no valid message at all, leaves
    /// the conversation untouched.
    pub async fn import_history(&self, payload: &Value) -> Result<ImportReport, CoreError> {
        let report = match validate_import(payload) {
            Ok(report) => report,
            Err(e) => {
                self.scheduler.emit_notice(&format!("Error: {}", e));
                return Err(e);
            }
        };
        for skip in &report.skipped {
            self.scheduler.emit_notice(&format!("Warning: {}", skip));
        }
        if report.messages.is_empty() {
            let err = CoreError::InvalidImport("no valid messages found".to_string());
            self.scheduler.emit_notice(&format!("Error: {}", err));
            return Err(err);
        }

        let imported = report.messages.clone();
        let character = self
            .scheduler
            .exclusive(|store| -> Result<String, CoreError> {
                store.reset(store.system_prompt());
                for message in imported {
                    store.append(message)?;
                }
                Ok(store.character())
            })
            .await?;

        self.save_history(&character);
        let _ = self
            .event_tx
            .send(EngineEvent::HistoryReplaced(report.messages.clone()));
        self.scheduler.emit_notice(&format!(
            "Chat history imported ({} messages)",
            report.messages.len()
        ));
        Ok(report)
    }

    pub async fn set_proactive_enabled(&self, enabled: bool) {
        self.proactive_enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.trigger.start();
            self.scheduler
                .emit_notice("Auto messages enabled - AI may initiate conversations.");
        } else {
            self.trigger.stop().await;
            self.scheduler
                .emit_notice("Auto messages disabled - AI will only respond to your messages.");
        }
    }

    /// Switch to `id`, persisting the current conversation and replaying the
    /// saved one for the new character. Unknown characters fall back to the
    /// built-in assistant.
    pub async fn select_character(&self, id: &str) -> CharacterProfile {
        self.trigger.stop().await;

        let resolved =
            CharacterProfile::resolve(id, self.prompts.as_ref(), &self.default_system_prompt);
        let profile = resolved
            .clone()
            .unwrap_or_else(|| CharacterProfile::default_assistant_with(&self.default_system_prompt));
        let history = self.history.clone();
        let replayed = self
            .scheduler
            .exclusive(|store| {
                let current = store.snapshot();
                if let Err(e) = history.save_history(&current.messages, &current.character) {
                    tracing::warn!("Failed to save history for '{}': {:#}", current.character, e);
                }

                store.reset(profile.system_prompt.clone());
                store.set_character(profile.display_name.clone());
                let mut replayed = Vec::new();
                for message in history.load_history(&profile.display_name) {
                    match store.append(message.clone()) {
                        Ok(()) => replayed.push(message),
                        Err(e) => tracing::warn!("Dropped saved message: {}", e),
                    }
                }
                replayed
            })
            .await;

        *self.profile.lock().unwrap_or_else(PoisonError::into_inner) = profile.clone();
        tracing::info!(
            "Selected character: {} ({} saved messages)",
            profile.display_name,
            replayed.len()
        );

        if resolved.is_none() {
            self.scheduler.emit_notice(&format!(
                "Error: Failed to load character prompt for '{}'. Using default.",
                id
            ));
        }
        let _ = self.event_tx.send(EngineEvent::HistoryReplaced(replayed));

        if self.is_proactive_enabled() {
            self.trigger.start();
        }
        profile
    }

    /// Replace the active system prompt. Blank text is ignored.
    pub async fn set_manual_prompt(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.scheduler
            .exclusive(|store| store.replace_system_prompt(text))
            .await;
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .system_prompt = text.to_string();
        self.scheduler.emit_notice("Manual system prompt set.");
        true
    }

    /// Stop the proactive loop and persist the conversation.
    pub async fn shutdown(&self) {
        self.trigger.stop().await;
        let character = self
            .scheduler
            .exclusive(|store| store.character())
            .await;
        self.save_history(&character);
        tracing::info!("Conversation engine shut down");
    }

    fn save_history(&self, character: &str) {
        if let Err(e) = self
            .history
            .save_history(&self.snapshot().messages, character)
        {
            tracing::warn!("Failed to save history for '{}': {:#}", character, e);
        }
    }
}
