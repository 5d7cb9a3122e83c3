use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const EMBEDDING_BATCH_SIZE: usize = 96;

pub type EmbeddingFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, EmbeddingError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding request failed: {0}")]
    ProviderFailure(String),
    #[error("embedding provider returned an invalid payload: {0}")]
    InvalidPayload(String),
    #[error("failed to build embedding http client: {0}")]
    HttpClient(String),
}

/// Turns texts into vectors, one per input and in input order.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, texts: &'a [String]) -> EmbeddingFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub embeddings_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: EmbedderConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbedderConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| EmbeddingError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request_body = json!({
            "model": self.config.model,
            "input": batch,
        });

        let response = self
            .client
            .post(&self.config.embeddings_url)
            .bearer_auth(&self.config.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    EmbeddingError::Timeout
                } else {
                    EmbeddingError::ProviderFailure("request_unavailable".to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|_| EmbeddingError::InvalidPayload("response_body_read_failed".to_string()))?;
        if !status.is_success() {
            return Err(EmbeddingError::ProviderFailure(format!(
                "status={}",
                status.as_u16()
            )));
        }

        let mut parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|_| EmbeddingError::InvalidPayload("response_json_parse_failed".to_string()))?;
        if parsed.data.len() != batch.len() {
            return Err(EmbeddingError::InvalidPayload(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> EmbeddingFuture<'a> {
        Box::pin(async move {
            let mut vectors = Vec::with_capacity(texts.len());
            for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
                vectors.extend(self.embed_batch(batch).await?);
            }
            Ok(vectors)
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}
