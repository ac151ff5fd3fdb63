//! Model gateways: embeddings (TEI or Ollama) and text generation (TGI or Ollama).

use crate::config::{env_or_default, parse_positive};
use crate::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_TEI_URL: &str = "http://localhost:8081";
const DEFAULT_TEI_PROVIDER: &str = "tei";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_EMBED_MODEL: &str = "nomic-embed-text:latest";
const DEFAULT_TGI_URL: &str = "http://localhost:8082";
const DEFAULT_TGI_PROVIDER: &str = "tgi";
const DEFAULT_OLLAMA_MODEL: &str = "phi4-mini:latest";
const DEFAULT_TEI_MAX_BATCH: usize = 32;
const DEFAULT_GENERATE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;

/// Turns texts into vectors, one per input, in input order
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Completes a prompt
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Embed `texts`, checking the gateway returned exactly one vector per text
pub(crate) async fn embed_all(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = embedder.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(EngineError::Inference(format!(
            "embedding gateway returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        )));
    }
    Ok(vectors)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EmbedProvider {
    Tei,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GenerateProvider {
    Tgi,
    Ollama,
}

/// HTTP embedding client
#[derive(Clone)]
pub struct TeiClient {
    client: Client,
    base_url: String,
    provider: EmbedProvider,
    model: String,
    max_batch: usize,
    dimension: Option<usize>,
}

impl TeiClient {
    /// TEI server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            provider: EmbedProvider::Tei,
            model: DEFAULT_OLLAMA_EMBED_MODEL.to_string(),
            max_batch: DEFAULT_TEI_MAX_BATCH,
            dimension: None,
        }
    }

    /// Ollama server at `base_url` serving `model`
    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: EmbedProvider::Ollama,
            model: model.into(),
            ..Self::new(base_url)
        }
    }

    /// Configure from `EMBED_*` environment variables
    pub fn from_env() -> Self {
        let provider = env_or_default("EMBED_PROVIDER", DEFAULT_TEI_PROVIDER);
        let mut client = if provider.eq_ignore_ascii_case("ollama") {
            Self::ollama(
                env_or_default("EMBED_URL", DEFAULT_OLLAMA_URL),
                env_or_default("EMBED_MODEL", DEFAULT_OLLAMA_EMBED_MODEL),
            )
        } else {
            Self::new(env_or_default("EMBED_URL", DEFAULT_TEI_URL))
        };

        if let Some(max_batch) = std::env::var("EMBED_MAX_BATCH")
            .ok()
            .and_then(|v| parse_positive(&v))
        {
            client.max_batch = max_batch;
        }
        client.dimension = std::env::var("EMBED_DIMENSION")
            .ok()
            .and_then(|v| parse_positive(&v));
        client
    }

    /// Reject vectors whose length differs from `dimension`
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            EmbedProvider::Tei => format!("{}/health", self.base_url),
            EmbedProvider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn validate_dimension(&self, embedding: &[f32]) -> Result<()> {
        match self.dimension {
            Some(expected) if embedding.len() != expected => Err(EngineError::Inference(format!(
                "Embedding dimension {} does not match expected {}",
                embedding.len(),
                expected
            ))),
            _ => Ok(()),
        }
    }

    async fn tei_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let mut results = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.max_batch) {
            let request = TeiEmbedBatchRequest {
                inputs: chunk,
                truncate: true,
            };

            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await?;

            results.extend(parse_embeddings_response(response)?);
        }

        Ok(results)
    }

    async fn ollama_embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = OllamaEmbedRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<OllamaEmbedResponse>()
            .await?;

        Ok(response.embedding)
    }
}

#[async_trait]
impl Embedder for TeiClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = match self.provider {
            EmbedProvider::Tei => self.tei_embed(texts).await?,
            EmbedProvider::Ollama => {
                let mut results = Vec::with_capacity(texts.len());
                for text in texts {
                    results.push(self.ollama_embed(text).await?);
                }
                results
            }
        };

        for embedding in &embeddings {
            self.validate_dimension(embedding)?;
        }
        debug!(count = embeddings.len(), "Embedded texts");
        Ok(embeddings)
    }
}

/// HTTP text-generation client
#[derive(Clone)]
pub struct TgiClient {
    client: Client,
    base_url: String,
    provider: GenerateProvider,
    model: String,
    max_new_tokens: u32,
    timeout: Duration,
}

impl TgiClient {
    /// TGI server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            provider: GenerateProvider::Tgi,
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            timeout: Duration::from_secs(DEFAULT_GENERATE_TIMEOUT_SECS),
        }
    }

    /// Ollama server at `base_url` serving `model`
    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: GenerateProvider::Ollama,
            model: model.into(),
            ..Self::new(base_url)
        }
    }

    /// Configure from `GEN_*` environment variables
    pub fn from_env() -> Self {
        let provider = env_or_default("GEN_PROVIDER", DEFAULT_TGI_PROVIDER);
        let client = if provider.eq_ignore_ascii_case("ollama") {
            Self::ollama(
                env_or_default("GEN_URL", DEFAULT_OLLAMA_URL),
                env_or_default("GEN_MODEL", DEFAULT_OLLAMA_MODEL),
            )
        } else {
            Self::new(env_or_default("GEN_URL", DEFAULT_TGI_URL))
        };

        match std::env::var("GEN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| parse_positive::<u64>(&v))
        {
            Some(secs) => client.with_timeout(Duration::from_secs(secs)),
            None => client,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            GenerateProvider::Tgi => format!("{}/health", self.base_url),
            GenerateProvider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn tgi_generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/generate", self.base_url);
        let request = TgiGenerateRequest {
            inputs: prompt.to_string(),
            parameters: TgiParameters {
                max_new_tokens: Some(self.max_new_tokens),
                return_full_text: Some(false),
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        extract_generated_text(response)
    }

    async fn ollama_generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<OllamaGenerateResponse>()
            .await?;

        if let Some(done_reason) = response.done_reason.as_deref() {
            debug!("Ollama done_reason={}", done_reason);
        }

        Ok(response.response)
    }
}

#[async_trait]
impl Generator for TgiClient {
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        match self.provider {
            GenerateProvider::Tgi => self.tgi_generate(prompt).await,
            GenerateProvider::Ollama => self.ollama_generate(prompt).await,
        }
    }
}

#[derive(Serialize)]
struct TeiEmbedBatchRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

#[derive(Serialize)]
struct TgiGenerateRequest {
    inputs: String,
    parameters: TgiParameters,
}

#[derive(Serialize)]
struct TgiParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_full_text: Option<bool>,
}

#[derive(Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

fn parse_embeddings_response(value: Value) -> Result<Vec<Vec<f32>>> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            if items.first().map(|v| v.is_array()).unwrap_or(false) {
                serde_json::from_value(Value::Array(items)).map_err(|e| {
                    EngineError::Inference(format!("Invalid TEI embeddings response: {}", e))
                })
            } else {
                let single: Vec<f32> =
                    serde_json::from_value(Value::Array(items)).map_err(|e| {
                        EngineError::Inference(format!("Invalid TEI embedding array: {}", e))
                    })?;
                Ok(vec![single])
            }
        }
        other => Err(EngineError::Inference(format!(
            "Unexpected TEI response format: {}",
            other
        ))),
    }
}

fn extract_generated_text(value: Value) -> Result<String> {
    match value {
        Value::Array(mut items) => {
            let first = items
                .pop()
                .ok_or_else(|| EngineError::Inference("Empty TGI response array".to_string()))?;
            extract_generated_text(first)
        }
        Value::Object(mut obj) => {
            if let Some(Value::String(text)) = obj.remove("generated_text") {
                Ok(text)
            } else if let Some(Value::String(text)) = obj.remove("response") {
                Ok(text)
            } else {
                Err(EngineError::Inference(
                    "TGI response missing generated text field".to_string(),
                ))
            }
        }
        other => Err(EngineError::Inference(format!(
            "Unexpected TGI response format: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Vec<Vec<f32>>);

    #[async_trait]
    impl Embedder for Fixed {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_batch_embeddings() {
        let parsed = parse_embeddings_response(json!([[0.1, 0.2], [0.3, 0.4]])).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], vec![0.3, 0.4]);
    }

    #[test]
    fn test_parse_single_embedding() {
        let parsed = parse_embeddings_response(json!([0.5, 0.5])).unwrap();
        assert_eq!(parsed, vec![vec![0.5, 0.5]]);
        assert!(parse_embeddings_response(json!({"error": "boom"})).is_err());
    }

    #[test]
    fn test_extract_generated_text() {
        assert_eq!(
            extract_generated_text(json!([{"generated_text": "hello"}])).unwrap(),
            "hello"
        );
        assert_eq!(
            extract_generated_text(json!({"response": "hi"})).unwrap(),
            "hi"
        );
        assert!(extract_generated_text(json!([])).is_err());
    }

    #[test]
    fn test_dimension_validation() {
        let client = TeiClient::new("http://localhost:1").with_dimension(3);
        assert!(client.validate_dimension(&[0.0, 1.0, 2.0]).is_ok());
        assert!(client.validate_dimension(&[0.0]).is_err());
    }

    #[tokio::test]
    async fn test_embed_all_checks_count() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let short = Fixed(vec![vec![1.0]]);
        let err = embed_all(&short, &texts).await.unwrap_err();
        assert!(matches!(err, EngineError::Inference(_)));

        let exact = Fixed(vec![vec![1.0], vec![2.0]]);
        assert_eq!(embed_all(&exact, &texts).await.unwrap().len(), 2);
        assert!(embed_all(&exact, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_connectivity_error() {
        let client = TeiClient::new("http://127.0.0.1:9");
        let err = client.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
