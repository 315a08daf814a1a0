//! External embedding service client: HTTP batching with exponential
//! backoff, plus exact token counting via `tiktoken-rs`.
//!
//! A thin `reqwest`-based client behind the `EmbeddingProvider` trait
//! object, required to match the remote provider's own tokenizer
//! exactly so chunk sizing never drifts from what the service will
//! itself accept or reject.

mod null;

pub use null::NullEmbeddingProvider;

use std::time::Duration;

use async_trait::async_trait;
use cidx_core::embedding::EmbeddingProvider;
use cidx_core::error::{CidxError, CidxResult};
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dims: usize,
    pub max_tokens_per_request: usize,
    pub max_retries: u32,
    pub timeout: Duration,
}

pub struct HttpEmbeddingProvider {
    config: HttpEmbeddingConfig,
    client: reqwest::Client,
    tokenizer: CoreBPE,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpEmbeddingConfig) -> CidxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        // cl100k_base is the tokenizer family OpenAI-compatible
        // embedding APIs standardize on.
        let tokenizer = tiktoken_rs::cl100k_base()
            .map_err(|e| CidxError::Internal(format!("failed to load tokenizer: {e}")))?;
        Ok(Self {
            config,
            client,
            tokenizer,
        })
    }

    async fn embed_batch_with_retry(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            match self.embed_batch_once(texts).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(attempt, ?backoff, error = %e, "embedding request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed_batch_once(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .json(&EmbedRequest {
                model: &self.config.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CidxError::Timeout(e.to_string())
                } else {
                    CidxError::ExternalFailure(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let retryable = status.is_server_error();
            let body = response.text().await.unwrap_or_default();
            return Err(if retryable {
                CidxError::ExternalFailure(format!("embedding service returned {status}: {body}"))
            } else {
                CidxError::InvalidInput(format!("embedding service rejected request ({status}): {body}"))
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| CidxError::ExternalFailure(format!("malformed embedding response: {e}")))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Exact token count via the same tokenizer family the provider
    /// uses, so a batcher built on this never over- or under-estimates
    /// what the service will itself reject.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.encode_with_special_tokens(text).len()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    fn max_tokens(&self) -> usize {
        self.config.max_tokens_per_request
    }

    async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<(String, usize)> = texts
            .iter()
            .map(|t| (t.clone(), self.count_tokens(t)))
            .collect();
        let batcher = cidx_core::embedding::TokenBudgetBatcher::new(256, self.config.max_tokens_per_request);
        let batches = batcher.batch(&items);

        let mut out = Vec::with_capacity(texts.len());
        for batch in batches {
            out.extend(self.embed_batch_with_retry(&batch).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_count_is_deterministic() {
        let config = HttpEmbeddingConfig {
            base_url: "http://localhost:9999".to_string(),
            model: "test-model".to_string(),
            dims: 4,
            max_tokens_per_request: 120_000,
            max_retries: 1,
            timeout: Duration::from_secs(5),
        };
        let provider = HttpEmbeddingProvider::new(config).unwrap();
        let a = provider.count_tokens("fn authenticate_user() {}");
        let b = provider.count_tokens("fn authenticate_user() {}");
        assert_eq!(a, b);
        assert!(a > 0);
    }
}
