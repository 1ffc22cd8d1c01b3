use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::chat_log::FileChatLog;
use crate::collaborators::WebSearch;
use crate::config::CompanionConfig;
use crate::engine::{ConversationEngine, EngineCollaborators, EngineSettings};
use crate::events::EngineEvent;
use crate::generation::GenerationBackend;
use crate::history::JsonHistoryStore;
use crate::llm_client::OllamaClient;
use crate::memory::SqliteMemoryStore;
use crate::notify::EventNotifier;
use crate::prompts::FilePromptLoader;
use crate::web::{GoogleSearch, HttpUrlFetch};

pub struct CompanionRuntime {
    pub config: CompanionConfig,
    pub engine: Arc<ConversationEngine>,
    pub chat_log: Arc<FileChatLog>,
    /// Present unless a custom backend was supplied.
    pub ollama: Option<OllamaClient>,
}

pub struct CompanionRuntimeBuilder {
    config: CompanionConfig,
    event_tx: Sender<EngineEvent>,
    backend: Option<Arc<dyn GenerationBackend>>,
}

impl CompanionRuntimeBuilder {
    pub fn new(config: CompanionConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            backend: None,
        }
    }

    /// Use `backend` instead of the configured Ollama server.
    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<CompanionRuntime> {
        let config = self.config;

        let mut ollama = None;
        let backend: Arc<dyn GenerationBackend> = match self.backend {
            Some(backend) => backend,
            None => {
                let client = OllamaClient::new(&config.llm_api_url, &config.llm_model)
                    .context("Failed to create Ollama client")?;
                tracing::info!("Generation backend: {} ({})", config.llm_api_url, config.llm_model);
                ollama = Some(client.clone());
                Arc::new(client)
            }
        };

        let memory = match SqliteMemoryStore::open(&config.memory_database_path) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(
                    "Failed to open memory database {}: {:#}; facts will not persist",
                    config.memory_database_path,
                    e
                );
                SqliteMemoryStore::open_in_memory()?
            }
        };

        let search = GoogleSearch::new(config.google_api_key.clone(), config.google_cse_id.clone())?;
        if !search.is_configured() {
            tracing::info!("Web search not configured");
        }

        let chat_log = Arc::new(
            FileChatLog::open(&config.chat_log_path).context("Failed to open chat log")?,
        );

        let collaborators = EngineCollaborators {
            prompts: Arc::new(FilePromptLoader::new(&config.character_dir)),
            memory: Arc::new(memory),
            search: Arc::new(search),
            fetcher: Arc::new(HttpUrlFetch::new()?),
            chat_log: chat_log.clone(),
            history: Arc::new(JsonHistoryStore::new(&config.history_dir)),
            notifier: Arc::new(EventNotifier::new(self.event_tx.clone())),
        };

        let settings = EngineSettings {
            params: config.generation_params(),
            default_system_prompt: config.default_system_prompt.clone(),
            proactive: config.proactive_settings(),
            proactive_enabled: config.enable_proactive,
            memory_fact_limit: config.memory_fact_limit,
            url_char_budget: config.url_char_budget,
            generation_timeout: config.generation_timeout(),
        };

        let engine = Arc::new(ConversationEngine::new(
            backend,
            collaborators,
            settings,
            self.event_tx,
        ));

        Ok(CompanionRuntime {
            config,
            engine,
            chat_log,
            ollama,
        })
    }
}

impl CompanionRuntime {
    pub fn bootstrap(config: CompanionConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        CompanionRuntimeBuilder::new(config, event_tx).build()
    }

    /// Load the configured character. Starts the proactive loop when enabled.
    pub async fn start(&self) {
        let profile = self.engine.select_character(&self.config.character).await;
        tracing::info!("Companion ready: {} on {}", profile.display_name, self.engine.model_name());
    }

    pub async fn available_models(&self) -> Vec<String> {
        match &self.ollama {
            Some(client) => client.list_models_or_fallback().await,
            None => vec![self.engine.model_name()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::prompts::DEFAULT_CHARACTER;
    use crate::test_support::ScriptedBackend;

    fn temp_config(dir: &std::path::Path) -> CompanionConfig {
        CompanionConfig {
            character: "nova".to_string(),
            character_dir: dir.join("characters").display().to_string(),
            history_dir: dir.join("histories").display().to_string(),
            memory_database_path: dir.join("data").join("memory.db").display().to_string(),
            chat_log_path: dir.join("chat.log").display().to_string(),
            enable_proactive: false,
            ..CompanionConfig::default()
        }
    }

    #[tokio::test]
    async fn builds_and_starts_with_configured_character() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("characters")).unwrap();
        std::fs::write(
            dir.path().join("characters").join("nova.txt"),
            "You are Nova, a night owl.",
        )
        .unwrap();
        let (event_tx, _events) = flume::unbounded();

        let runtime = CompanionRuntimeBuilder::new(temp_config(dir.path()), event_tx)
            .with_backend(Arc::new(ScriptedBackend::replying("Evening!")))
            .build()
            .unwrap();
        runtime.start().await;

        assert_eq!(runtime.engine.profile().display_name, "Nova");
        assert!(!runtime.engine.is_proactive_running());
        assert_eq!(runtime.available_models().await, vec!["test-model"]);

        runtime
            .engine
            .send_user_message("good evening", None)
            .await
            .unwrap();

        assert!(dir.path().join("data").join("memory.db").exists());
        assert!(dir
            .path()
            .join("histories")
            .join("chat_history_Nova.json")
            .exists());
        let log = runtime.chat_log.view_tail(10_000).unwrap();
        assert!(log.contains("USER: good evening"));
        assert!(log.contains("ASSISTANT: Evening!"));
    }

    #[tokio::test]
    async fn configured_default_prompt_seeds_builtin_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let config = CompanionConfig {
            character: DEFAULT_CHARACTER.to_string(),
            default_system_prompt: "You are a terse librarian.".to_string(),
            ..temp_config(dir.path())
        };
        let (event_tx, _events) = flume::unbounded();

        let runtime = CompanionRuntimeBuilder::new(config, event_tx)
            .with_backend(Arc::new(ScriptedBackend::replying("Shh.")))
            .build()
            .unwrap();
        assert_eq!(
            runtime.engine.snapshot().messages[0],
            Message::system("You are a terse librarian.")
        );

        runtime.start().await;
        assert_eq!(
            runtime.engine.snapshot().messages[0],
            Message::system("You are a terse librarian.")
        );
        assert_eq!(runtime.engine.profile().display_name, "AI");
    }
}
