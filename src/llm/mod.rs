//! LLM client capability
//!
//! This module provides an abstraction over LLM providers with:
//! - A trait for embedding and completion calls
//! - An implementation for any OpenAI-compatible HTTP endpoint

pub mod cache;

pub use cache::LlmCache;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Trait for LLM providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Embed a text into a dense vector
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;

    /// Run a completion prompt and return the raw text answer
    async fn complete(&self, model: &str, prompt: &str) -> Result<String>;
}

/// Client for OpenAI-compatible providers
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Data { data: Vec<EmbeddingData> },
    Embeddings { embeddings: Vec<Vec<f32>> },
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbedResponse {
    fn into_first(self) -> Option<Vec<f32>> {
        match self {
            EmbedResponse::Data { data } => data.into_iter().next().map(|d| d.embedding),
            EmbedResponse::Embeddings { embeddings } => embeddings.into_iter().next(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let response = self
            .request("/embeddings")
            .json(&EmbedRequest {
                model,
                input: vec![text],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "embeddings returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let parsed: EmbedResponse = response.json().await?;
        parsed
            .into_first()
            .ok_or_else(|| Error::Upstream("embeddings response was empty".into()))
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        debug!(model, prompt_len = prompt.len(), "completion request");
        let response = self
            .request("/chat/completions")
            .json(&ChatRequest {
                model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "completions returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Upstream("completion response had no choices".into()))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
