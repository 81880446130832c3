//! Embedding provider abstraction and implementations.
//!
//! - [`DisabledProvider`]: returns errors; documents are stored without vectors.
//! - [`HashProvider`]: deterministic feature hashing over word tokens, no network.
//!   Good enough for local runs and tests, not for semantic quality.
//! - [`RemoteProvider`]: OpenAI `POST /v1/embeddings`, Ollama `POST /api/embed`
//!   or Google Generative Language `batchEmbedContents`.
//!
//! Every vector is checked against `embedding.dims` before it reaches the
//! document store; the column width is fixed at migration time.
//!
//! # Retry Strategy
//!
//! Remote providers use exponential backoff for transient errors:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

mod hashing;

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::ServiceError;

pub use hashing::hash_embedding;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

/// Default model per provider when `embedding.model` is unset.
pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "text-embedding-3-small",
        "ollama" => "nomic-embed-text",
        "google" => "text-embedding-004",
        "hash" => "sha256-feature-hash",
        _ => "disabled",
    }
}

fn model_of(config: &EmbeddingConfig) -> String {
    config
        .model
        .clone()
        .unwrap_or_else(|| default_model(&config.provider).to_string())
}

/// Embed a batch of texts with the configured provider, in input order.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "hash" => Ok(texts
            .iter()
            .map(|t| hash_embedding(t, config.dims))
            .collect()),
        "openai" => embed_openai(config, texts).await,
        "ollama" => embed_ollama(config, texts).await,
        "google" => embed_google(config, texts).await,
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ Hash Provider ============

pub struct HashProvider {
    dims: usize,
}

impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }
    fn model_name(&self) -> &str {
        default_model("hash")
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Remote Providers ============

/// Shared shape of the three HTTP-backed providers.
pub struct RemoteProvider {
    name: &'static str,
    model: String,
    dims: usize,
}

impl EmbeddingProvider for RemoteProvider {
    fn name(&self) -> &str {
        self.name
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// POST `body` with the retry policy described in the module docs.
async fn post_with_retry<F>(
    config: &EmbeddingConfig,
    label: &str,
    build: F,
    body: &serde_json::Value,
) -> Result<serde_json::Value>
where
    F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
{
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        match build(&client).json(body).send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let model = model_of(config);

    let mut body = serde_json::json!({
        "model": model,
        "input": texts,
    });
    if model.starts_with("text-embedding-3") {
        body["dimensions"] = serde_json::json!(config.dims);
    }

    let json = post_with_retry(
        config,
        "OpenAI",
        |client| client.post(OPENAI_URL).bearer_auth(&api_key),
        &body,
    )
    .await?;
    parse_openai_response(&json)
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let url = config.url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL);
    let body = serde_json::json!({
        "model": model_of(config),
        "input": texts,
    });

    let endpoint = format!("{}/api/embed", url.trim_end_matches('/'));
    let json = post_with_retry(config, "Ollama", |client| client.post(&endpoint), &body).await?;
    parse_ollama_response(&json)
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings.iter().map(|e| to_vector(e, "Ollama")).collect()
}

async fn embed_google(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("GOOGLE_API_KEY").map_err(|_| anyhow::anyhow!("GOOGLE_API_KEY not set"))?;
    let model = model_of(config);

    let requests: Vec<serde_json::Value> = texts
        .iter()
        .map(|text| {
            serde_json::json!({
                "model": format!("models/{}", model),
                "content": { "parts": [{ "text": text }] },
            })
        })
        .collect();
    let body = serde_json::json!({ "requests": requests });

    let endpoint = format!("{}/models/{}:batchEmbedContents", GOOGLE_BASE_URL, model);
    let json = post_with_retry(
        config,
        "Google",
        |client| client.post(&endpoint).header("x-goog-api-key", &api_key),
        &body,
    )
    .await?;
    parse_google_response(&json)
}

fn parse_google_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Google response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            let values = e
                .get("values")
                .ok_or_else(|| anyhow::anyhow!("Invalid Google response: missing values"))?;
            to_vector(values, "Google")
        })
        .collect()
}

fn to_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", label))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"hash"` | [`HashProvider`] |
/// | `"openai"` | [`RemoteProvider`] (needs `OPENAI_API_KEY`) |
/// | `"ollama"` | [`RemoteProvider`] |
/// | `"google"` | [`RemoteProvider`] (needs `GOOGLE_API_KEY`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let remote = |name: &'static str| RemoteProvider {
        name,
        model: model_of(config),
        dims: config.dims,
    };
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "hash" => Ok(Box::new(HashProvider { dims: config.dims })),
        "openai" => {
            if std::env::var("OPENAI_API_KEY").is_err() {
                bail!("OPENAI_API_KEY environment variable not set");
            }
            Ok(Box::new(remote("openai")))
        }
        "ollama" => Ok(Box::new(remote("ollama"))),
        "google" => {
            if std::env::var("GOOGLE_API_KEY").is_err() {
                bail!("GOOGLE_API_KEY environment variable not set");
            }
            Ok(Box::new(remote("google")))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Fail unless `vector` has exactly `expected` components.
pub fn check_dimensions(vector: &[f32], expected: usize) -> Result<(), ServiceError> {
    if vector.len() != expected {
        return Err(ServiceError::EmbeddingDimension {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Configured provider plus the settings its calls need.
pub struct Embedder {
    config: EmbeddingConfig,
    provider: Box<dyn EmbeddingProvider>,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            provider: create_provider(config)?,
            config: config.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    /// Embed one text and verify its width.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        if !self.is_enabled() {
            return Err(ServiceError::validation(
                "embeddings are disabled; set [embedding].provider",
            ));
        }
        let vector = embed_texts(&self.config, &[text.to_string()])
            .await
            .map_err(|e| ServiceError::upstream("embedding", e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceError::upstream("embedding", anyhow::anyhow!("empty embedding response"))
            })?;
        check_dimensions(&vector, self.config.dims)?;
        Ok(vector)
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn ollama_and_google_parsing() {
        let ollama = serde_json::json!({ "embeddings": [[0.5, 0.25]] });
        assert_eq!(parse_ollama_response(&ollama).unwrap(), vec![vec![0.5, 0.25]]);

        let google = serde_json::json!({ "embeddings": [{ "values": [0.1, 0.2, 0.3] }] });
        assert_eq!(parse_google_response(&google).unwrap()[0].len(), 3);
        assert!(parse_google_response(&serde_json::json!({ "embeddings": [{}] })).is_err());
    }

    #[test]
    fn dimension_check() {
        assert!(check_dimensions(&[0.0; 4], 4).is_ok());
        let err = check_dimensions(&[0.0; 3], 4).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::EmbeddingDimension {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let config = EmbeddingConfig {
            provider: "hash".into(),
            dims: 64,
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::new(&config).unwrap();
        let a = embedder.embed("rust async runtimes").await.unwrap();
        let b = embedder.embed("rust async runtimes").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_eq!(embedder.provider_name(), "hash");
    }

    #[tokio::test]
    async fn disabled_embedder_rejects() {
        let config = EmbeddingConfig {
            provider: "disabled".into(),
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::new(&config).unwrap();
        assert!(matches!(
            embedder.embed("x").await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn default_models() {
        assert_eq!(default_model("ollama"), "nomic-embed-text");
        assert_eq!(default_model("openai"), "text-embedding-3-small");
        assert_eq!(default_model("google"), "text-embedding-004");
    }
}
