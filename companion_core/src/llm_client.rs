use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::generation::{GenerationBackend, SamplingOptions};
use crate::http_client::build_http_client;
use crate::message::Message;

/// Shown when the server is unreachable or has no models pulled.
pub const FALLBACK_MODELS: &[&str] = &["llama3.2:1b", "qwen2.5:0.5b", "gemma2:2b"];

/// Client for a local Ollama server's `/api/chat` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    api_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaClient {
    pub fn new(api_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: build_http_client()?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.api_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach Ollama server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Ollama returned error {}: {}", status, body);
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse model list")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Server models, or [`FALLBACK_MODELS`] when none can be listed.
    pub async fn list_models_or_fallback(&self) -> Vec<String> {
        match self.list_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                tracing::warn!("Ollama reports no models; offering fallback list");
                FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
            }
            Err(e) => {
                tracing::warn!("Could not list Ollama models: {:#}", e);
                FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
            }
        }
    }

    async fn encode_images(message: &Message) -> Vec<String> {
        let Some(path) = &message.attachment else {
            return Vec::new();
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => vec![base64::engine::general_purpose::STANDARD.encode(bytes)],
            Err(e) => {
                tracing::warn!("Skipping image {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn chat(&self, messages: &[Message], options: SamplingOptions) -> Result<String> {
        let url = format!("{}/api/chat", self.api_url);

        let mut wire = Vec::with_capacity(messages.len());
        for message in messages {
            wire.push(ChatMessage {
                role: message.role.as_str(),
                content: &message.content,
                images: Self::encode_images(message).await,
            });
        }

        let request = ChatRequest {
            model: &self.model,
            messages: wire,
            stream: false,
            options,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Ollama returned error {}: {}", status, body);
        }

        let completion: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;

        Ok(completion.message.map(|m| m.content).unwrap_or_default())
    }
}
