//! Single-shot generation with one empty-output retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::PromptFormat;
use crate::error::CoreError;
use crate::message::Message;

/// Prefix on replies that only came through on the fallback attempt.
pub const RETRY_INDICATOR: &str = "🔄 ";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
}

impl SamplingOptions {
    /// Conservative settings used for the retry.
    pub const SAFE: SamplingOptions = SamplingOptions {
        temperature: 0.7,
        top_p: 0.9,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub prompt_format: PromptFormat,
}

impl GenerationParams {
    pub fn sampling(&self) -> SamplingOptions {
        SamplingOptions {
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            prompt_format: PromptFormat::Plain,
        }
    }
}

/// A chat-style text generation endpoint.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn model_name(&self) -> String;

    /// Returns the raw reply text, which may be empty.
    async fn chat(&self, messages: &[Message], options: SamplingOptions) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Ok,
    OkAfterRetry,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub outcome: GenerationOutcome,
    pub text: Option<String>,
    pub error: Option<CoreError>,
}

impl GenerationResult {
    fn ok(text: String) -> Self {
        Self {
            outcome: GenerationOutcome::Ok,
            text: Some(text),
            error: None,
        }
    }

    fn ok_after_retry(text: String) -> Self {
        Self {
            outcome: GenerationOutcome::OkAfterRetry,
            text: Some(format!("{}{}", RETRY_INDICATOR, text)),
            error: None,
        }
    }

    fn failed(error: CoreError) -> Self {
        Self {
            outcome: GenerationOutcome::Failed,
            text: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome != GenerationOutcome::Failed
    }

    /// User-facing text for a failed result.
    pub fn failure_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| format!("Error: {}", e))
    }
}

pub struct GenerationInvoker {
    backend: Arc<dyn GenerationBackend>,
    deadline: Option<Duration>,
}

impl GenerationInvoker {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            deadline: None,
        }
    }

    /// Bound every backend call by `deadline`. Expiry counts as a backend failure.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn model_name(&self) -> String {
        self.backend.model_name()
    }

    pub async fn invoke(&self, messages: &[Message], params: &GenerationParams) -> GenerationResult {
        let model = self.backend.model_name();
        let started = Instant::now();

        let first = match self.call(messages, params.sampling()).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Generation with {} failed: {:#}", model, e);
                return GenerationResult::failed(CoreError::BackendUnavailable {
                    model,
                    detail: format!("{:#}", e),
                });
            }
        };

        if !first.trim().is_empty() {
            tracing::debug!(
                "Generation with {} finished in {:.2}s",
                model,
                started.elapsed().as_secs_f32()
            );
            return GenerationResult::ok(first);
        }

        tracing::warn!("{} returned an empty reply, retrying with safe sampling", model);
        match self.call(messages, SamplingOptions::SAFE).await {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(
                    "Retry with {} succeeded after {:.2}s",
                    model,
                    started.elapsed().as_secs_f32()
                );
                GenerationResult::ok_after_retry(text)
            }
            Ok(_) => {
                tracing::error!("{} returned empty output on both attempts", model);
                GenerationResult::failed(CoreError::EmptyGeneration { model })
            }
            Err(e) => {
                tracing::error!("Retry with {} failed: {:#}", model, e);
                GenerationResult::failed(CoreError::BackendUnavailable {
                    model,
                    detail: format!("{:#}", e),
                })
            }
        }
    }

    async fn call(&self, messages: &[Message], options: SamplingOptions) -> anyhow::Result<String> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.backend.chat(messages, options))
                .await
                .map_err(|_| anyhow::anyhow!("no reply within {}s", deadline.as_secs()))?,
            None => self.backend.chat(messages, options).await,
        }
    }
}
