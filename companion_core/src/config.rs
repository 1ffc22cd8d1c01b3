use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::{PromptFormat, DEFAULT_MEMORY_FACT_LIMIT, DEFAULT_URL_CHAR_BUDGET};
use crate::generation::GenerationParams;
use crate::proactive::ProactiveSettings;
use crate::prompts::{DEFAULT_CHARACTER, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub prompt_format: PromptFormat,

    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    /// Character selected at startup.
    #[serde(default = "default_character")]
    pub character: String,
    #[serde(default = "default_character_dir")]
    pub character_dir: String,
    #[serde(default = "default_history_dir")]
    pub history_dir: String,
    #[serde(default = "default_memory_database_path")]
    pub memory_database_path: String,
    #[serde(default = "default_chat_log_path")]
    pub chat_log_path: String,

    // Web search (Google Custom Search)
    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default)]
    pub google_cse_id: Option<String>,

    #[serde(default = "default_true")]
    pub enable_proactive: bool,
    #[serde(default = "default_proactive_initial_delay_secs")]
    pub proactive_initial_delay_secs: u64,
    #[serde(default = "default_proactive_min_interval_secs")]
    pub proactive_min_interval_secs: u64,
    #[serde(default = "default_proactive_max_interval_secs")]
    pub proactive_max_interval_secs: u64,
    #[serde(default = "default_proactive_error_backoff_secs")]
    pub proactive_error_backoff_secs: u64,

    /// Upper bound on a single backend call.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_memory_fact_limit")]
    pub memory_fact_limit: usize,
    #[serde(default = "default_url_char_budget")]
    pub url_char_budget: usize,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2:1b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_character() -> String {
    DEFAULT_CHARACTER.to_string()
}

fn default_character_dir() -> String {
    "characters".to_string()
}

fn default_history_dir() -> String {
    "chat_histories".to_string()
}

fn default_memory_database_path() -> String {
    "chat_histories/long_term_memory.db".to_string()
}

fn default_chat_log_path() -> String {
    "chat.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_proactive_initial_delay_secs() -> u64 {
    15
}

fn default_proactive_min_interval_secs() -> u64 {
    45
}

fn default_proactive_max_interval_secs() -> u64 {
    90
}

fn default_proactive_error_backoff_secs() -> u64 {
    60
}

fn default_generation_timeout_secs() -> u64 {
    300
}

fn default_memory_fact_limit() -> usize {
    DEFAULT_MEMORY_FACT_LIMIT
}

fn default_url_char_budget() -> usize {
    DEFAULT_URL_CHAR_BUDGET
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            prompt_format: PromptFormat::default(),
            default_system_prompt: default_system_prompt(),
            character: default_character(),
            character_dir: default_character_dir(),
            history_dir: default_history_dir(),
            memory_database_path: default_memory_database_path(),
            chat_log_path: default_chat_log_path(),
            google_api_key: None,
            google_cse_id: None,
            enable_proactive: true,
            proactive_initial_delay_secs: default_proactive_initial_delay_secs(),
            proactive_min_interval_secs: default_proactive_min_interval_secs(),
            proactive_max_interval_secs: default_proactive_max_interval_secs(),
            proactive_error_backoff_secs: default_proactive_error_backoff_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            memory_fact_limit: default_memory_fact_limit(),
            url_char_budget: default_url_char_budget(),
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load config from companion_config.toml (next to executable), falling
    /// back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Ok(None) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::from_env()
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                Self::from_env()
            }
        }
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<CompanionConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(config))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("OLLAMA_HOST") {
            self.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = lookup("GOOGLE_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.google_api_key = Some(key);
        }

        if let Some(id) = lookup("GOOGLE_CSE_ID").filter(|v| !v.trim().is_empty()) {
            self.google_cse_id = Some(id);
        }

        if let Some(enabled) = lookup("COMPANION_ENABLE_PROACTIVE") {
            self.enable_proactive = parse_flag(&enabled);
        }

        if let Some(character) = lookup("COMPANION_CHARACTER").filter(|v| !v.trim().is_empty()) {
            self.character = character;
        }

        if let Some(timeout) = lookup("COMPANION_GENERATION_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                self.generation_timeout_secs = seconds;
            }
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            prompt_format: self.prompt_format,
        }
    }

    pub fn proactive_settings(&self) -> ProactiveSettings {
        ProactiveSettings {
            initial_delay: Duration::from_secs(self.proactive_initial_delay_secs),
            min_interval: Duration::from_secs(self.proactive_min_interval_secs),
            max_interval: Duration::from_secs(self.proactive_max_interval_secs),
            error_backoff: Duration::from_secs(self.proactive_error_backoff_secs),
            ..ProactiveSettings::default()
        }
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        (self.generation_timeout_secs > 0).then(|| Duration::from_secs(self.generation_timeout_secs))
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}
