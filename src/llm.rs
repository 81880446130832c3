//! LLM provider selection and completion dispatch.
//!
//! `llm.provider = "auto"` probes in order: a reachable Ollama
//! (`GET /api/tags`, 2s timeout), then `GOOGLE_API_KEY`, then
//! `OPENAI_API_KEY`, and falls back to Ollama. The chosen provider is a
//! [`CompletionProvider`] strategy object held by the server.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::embedding;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Google,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Ollama => "ollama",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(Self::OpenAi),
            "google" => Some(Self::Google),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub provider: String,
    pub llm_model: String,
    pub embeddings_provider: String,
    pub embeddings_model: String,
}

async fn ollama_reachable(host: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    match client
        .get(format!("{}/api/tags", host.trim_end_matches('/')))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

fn env_present(key: &str) -> bool {
    std::env::var(key).is_ok_and(|v| !v.trim().is_empty())
}

/// Resolve `llm.provider`, probing when it is `auto`.
pub async fn detect_provider(config: &LlmConfig) -> ProviderKind {
    if let Some(kind) = ProviderKind::parse(&config.provider) {
        return kind;
    }

    if ollama_reachable(&config.ollama_host).await {
        tracing::info!(host = %config.ollama_host, "auto-detected Ollama");
        return ProviderKind::Ollama;
    }
    if env_present("GOOGLE_API_KEY") {
        tracing::info!("auto-detected Google (GOOGLE_API_KEY set)");
        return ProviderKind::Google;
    }
    if env_present("OPENAI_API_KEY") {
        tracing::info!("auto-detected OpenAI (OPENAI_API_KEY set)");
        return ProviderKind::OpenAi;
    }
    tracing::warn!("no LLM provider detected; defaulting to Ollama");
    ProviderKind::Ollama
}

pub fn model_for(kind: ProviderKind, config: &LlmConfig) -> &str {
    match kind {
        ProviderKind::OpenAi => &config.openai_model,
        ProviderKind::Google => &config.google_model,
        ProviderKind::Ollama => &config.ollama_model,
    }
}

pub fn provider_info(
    kind: ProviderKind,
    config: &LlmConfig,
    embedding: &EmbeddingConfig,
) -> ProviderInfo {
    ProviderInfo {
        provider: kind.to_string(),
        llm_model: model_for(kind, config).to_string(),
        embeddings_provider: embedding.provider.clone(),
        embeddings_model: embedding
            .model
            .clone()
            .unwrap_or_else(|| embedding::default_model(&embedding.provider).to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    pub model: String,
}

/// One hosted (or local) text-generation backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    /// Generate a completion; `model` overrides the default.
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Completion>;
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn post_json(request: reqwest::RequestBuilder, label: &str) -> Result<serde_json::Value> {
    let response = request
        .send()
        .await
        .with_context(|| format!("{} request failed", label))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{} API error {}: {}", label, status, body);
    }
    Ok(response.json().await?)
}

pub struct OpenAiCompletion {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
    fn name(&self) -> &str {
        "openai"
    }
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Completion> {
        let model = model.unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let json = post_json(
            self.client
                .post(OPENAI_CHAT_URL)
                .bearer_auth(&self.api_key)
                .json(&body),
            "OpenAI",
        )
        .await?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .context("Invalid OpenAI response: missing choices[0].message.content")?;
        Ok(Completion {
            text: text.to_string(),
            provider: self.name().to_string(),
            model: model.to_string(),
        })
    }
}

pub struct GeminiCompletion {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl CompletionProvider for GeminiCompletion {
    fn name(&self) -> &str {
        "google"
    }
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Completion> {
        let model = model.unwrap_or(&self.model);
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let json = post_json(
            self.client
                .post(format!("{}/models/{}:generateContent", GOOGLE_BASE_URL, model))
                .header("x-goog-api-key", &self.api_key)
                .json(&body),
            "Google",
        )
        .await?;
        let parts = json
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .context("Invalid Google response: missing candidates[0].content.parts")?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();
        Ok(Completion {
            text,
            provider: self.name().to_string(),
            model: model.to_string(),
        })
    }
}

pub struct OllamaCompletion {
    client: reqwest::Client,
    host: String,
    model: String,
}

#[async_trait]
impl CompletionProvider for OllamaCompletion {
    fn name(&self) -> &str {
        "ollama"
    }
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Completion> {
        let model = model.unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        let json = post_json(
            self.client
                .post(format!("{}/api/generate", self.host.trim_end_matches('/')))
                .json(&body),
            "Ollama",
        )
        .await?;
        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .context("Invalid Ollama response: missing response")?;
        Ok(Completion {
            text: text.to_string(),
            provider: self.name().to_string(),
            model: model.to_string(),
        })
    }
}

/// Build the strategy for `kind`. Missing API keys are reported at call
/// time so the service can still start without an LLM.
pub fn build_provider(kind: ProviderKind, config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>> {
    let client = http_client(config.timeout_secs)?;
    let env = |key: &str| std::env::var(key).unwrap_or_default();
    let provider: Arc<dyn CompletionProvider> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiCompletion {
            client,
            api_key: env("OPENAI_API_KEY"),
            model: config.openai_model.clone(),
        }),
        ProviderKind::Google => Arc::new(GeminiCompletion {
            client,
            api_key: env("GOOGLE_API_KEY"),
            model: config.google_model.clone(),
        }),
        ProviderKind::Ollama => Arc::new(OllamaCompletion {
            client,
            host: config.ollama_host.clone(),
            model: config.ollama_model.clone(),
        }),
    };
    Ok(provider)
}
