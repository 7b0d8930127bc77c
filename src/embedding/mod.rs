//! Embedding provider abstraction.
//!
//! `embed(texts) -> vectors` is synchronous from the ingestion pipeline's
//! point of view but batched and retried internally. Vectors are always
//! L2-normalized before being returned, so downstream cosine similarity is
//! a plain dot product. Transient failures (HTTP 429/5xx, network errors)
//! retry up to 3 times with exponential backoff; anything else propagates
//! immediately so the ingestion pipeline can fail just that document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ErrorKind, KError, KResult};

/// Maximum retry attempts for a transient embedding failure.
const MAX_RETRY_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    /// Whether this provider returns the same vector for the same input
    /// every time (lets callers cache embeddings by text hash).
    fn deterministic(&self) -> bool {
        true
    }
    /// Embed a batch of texts in one logical call. Implementations choose
    /// their own internal wire batch size; order is preserved.
    async fn embed(&self, texts: &[String]) -> KResult<Vec<Vec<f32>>>;
}

/// Runtime settings for the configured embedding backend. Separate from
/// [`crate::models::KBConfig`]: a KB only names the model id it expects;
/// credentials, batch size, and timeouts are instance-wide operational
/// settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    MAX_RETRY_ATTEMPTS
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingSettings {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn create_provider(settings: &EmbeddingSettings) -> KResult<Box<dyn EmbeddingProvider>> {
    match settings.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(settings)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(settings)?)),
        other => Err(KError::invalid_input(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Embed a batch of texts, splitting into the provider's configured batch
/// size and normalizing every returned vector to unit length.
pub async fn embed_batched(
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingSettings,
    texts: &[String],
) -> KResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(settings.batch_size.max(1)) {
        let vectors = provider.embed(batch).await?;
        for v in vectors {
            out.push(normalize(&v));
        }
    }
    Ok(out)
}

/// L2-normalize a vector; the zero vector is returned unchanged (there is
/// no meaningful direction to normalize to).
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine similarity, which for L2-normalized vectors is exactly the dot
/// product. Returns `0.0` for empty or mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============ Disabled provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_id(&self) -> &str {
        "disabled"
    }
    fn dimension(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> KResult<Vec<Vec<f32>>> {
        Err(KError::new(
            ErrorKind::EmbeddingFailed,
            "embedding provider is disabled",
        ))
    }
}

// ============ OpenAI provider ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAIProvider {
    pub fn new(settings: &EmbeddingSettings) -> KResult<Self> {
        let model = settings
            .model
            .clone()
            .ok_or_else(|| KError::invalid_input("embedding.model required for openai provider"))?;
        let dims = settings
            .dims
            .ok_or_else(|| KError::invalid_input("embedding.dims required for openai provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(KError::invalid_input("OPENAI_API_KEY environment variable not set"));
        }
        Ok(Self {
            model,
            dims,
            max_retries: settings.max_retries,
            timeout_secs: settings.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> KResult<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| KError::invalid_input("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| KError::internal(e.to_string()))?;

        let body = serde_json::json!({ "model": self.model, "input": texts });
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {api_key}"))
                .json(&body)
                .send()
                .await;
            match handle_response(resp, parse_openai_response).await? {
                RetryOutcome::Success(v) => return Ok(v),
                RetryOutcome::Retryable(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| KError::new(ErrorKind::EmbeddingFailed, "embedding failed after retries")))
    }
}

fn parse_openai_response(json: &serde_json::Value) -> KResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| KError::new(ErrorKind::EmbeddingFailed, "missing data array in openai response"))?;
    Ok(data
        .iter()
        .map(|item| {
            item.get("embedding")
                .and_then(|e| e.as_array())
                .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                .unwrap_or_default()
        })
        .collect())
}

// ============ Ollama provider ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(settings: &EmbeddingSettings) -> KResult<Self> {
        let model = settings
            .model
            .clone()
            .ok_or_else(|| KError::invalid_input("embedding.model required for ollama provider"))?;
        let dims = settings
            .dims
            .ok_or_else(|| KError::invalid_input("embedding.dims required for ollama provider"))?;
        let url = settings
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims,
            url,
            max_retries: settings.max_retries,
            timeout_secs: settings.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> KResult<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| KError::internal(e.to_string()))?;
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let endpoint = format!("{}/api/embed", self.url);

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
            let resp = client.post(&endpoint).json(&body).send().await;
            match handle_response(resp, parse_ollama_response).await? {
                RetryOutcome::Success(v) => return Ok(v),
                RetryOutcome::Retryable(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| KError::new(ErrorKind::EmbeddingFailed, "embedding failed after retries")))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> KResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| KError::new(ErrorKind::EmbeddingFailed, "missing embeddings array in ollama response"))?;
    Ok(embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                .unwrap_or_default()
        })
        .collect())
}

enum RetryOutcome {
    Success(Vec<Vec<f32>>),
    Retryable(KError),
}

async fn handle_response(
    resp: Result<reqwest::Response, reqwest::Error>,
    parse: fn(&serde_json::Value) -> KResult<Vec<Vec<f32>>>,
) -> KResult<RetryOutcome> {
    match resp {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                let json: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| KError::new(ErrorKind::EmbeddingFailed, e.to_string()))?;
                return parse(&json).map(RetryOutcome::Success);
            }
            let body_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                Ok(RetryOutcome::Retryable(KError::new(
                    ErrorKind::EmbeddingFailed,
                    format!("embedding API error {status}: {body_text}"),
                )))
            } else {
                Err(KError::new(
                    ErrorKind::EmbeddingFailed,
                    format!("embedding API error {status}: {body_text}"),
                ))
            }
        }
        Err(e) => Ok(RetryOutcome::Retryable(KError::new(
            ErrorKind::EmbeddingFailed,
            e.to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let v = normalize(&[3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_is_unchanged() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_identical_unit_vectors_is_one() {
        let v = normalize(&[1.0, 2.0, 3.0]);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn disabled_provider_errors_on_embed() {
        let provider = DisabledProvider;
        assert_eq!(provider.dimension(), 0);
    }

    #[test]
    fn openai_provider_requires_model_and_key() {
        std::env::remove_var("OPENAI_API_KEY");
        let settings = EmbeddingSettings {
            provider: "openai".to_string(),
            ..Default::default()
        };
        assert!(OpenAIProvider::new(&settings).is_err());
    }
}
