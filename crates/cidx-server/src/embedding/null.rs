//! No-op embedding provider for `embedding.provider = "disabled"`.
//! Semantic search and `AddIndex(semantic)` are then unavailable;
//! FTS/temporal/SCIP are unaffected.

use async_trait::async_trait;
use cidx_core::embedding::EmbeddingProvider;
use cidx_core::error::{CidxError, CidxResult};

pub struct NullEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    fn max_tokens(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        Err(CidxError::InvalidInput(
            "embeddings are disabled on this server".to_string(),
        ))
    }
}
