//! Embedding provider abstraction and the vector helpers shared by the
//! path-quantization and search algorithms.
//!
//! `embed` takes a batch rather than a single text, since CIDX embeds
//! whole repositories at refresh time rather than one document at a
//! time.

use async_trait::async_trait;

use crate::error::CidxResult;

/// A model capable of turning text into fixed-dimension vectors.
///
/// Implementors live in `cidx-server` (an HTTP client against a local or
/// hosted embedding service); this crate only needs the contract.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable model identifier, stored alongside each `VectorRecord` so a
    /// later model swap can be detected instead of silently producing
    /// incomparable vectors.
    fn model_name(&self) -> &str;

    /// Output dimensionality. Every vector this provider returns must
    /// have exactly this length.
    fn dims(&self) -> usize;

    /// Maximum number of input tokens this model will accept per chunk.
    fn max_tokens(&self) -> usize;

    /// Embed a batch of texts in one call. Implementors should respect
    /// their own rate limits internally; callers should pre-split with
    /// [`TokenBudgetBatcher`] rather than submitting oversized batches.
    async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>>;
}

/// Splits a sequence of chunks into batches that fit both a maximum
/// batch size and an approximate total-token budget, so a single
/// `embed()` call never exceeds what the backing model/service accepts.
///
/// Token counts are caller-supplied (typically from `tiktoken-rs`) since
/// this crate stays tokenizer-agnostic.
pub struct TokenBudgetBatcher {
    max_batch_len: usize,
    max_batch_tokens: usize,
}

impl TokenBudgetBatcher {
    pub fn new(max_batch_len: usize, max_batch_tokens: usize) -> Self {
        Self {
            max_batch_len,
            max_batch_tokens,
        }
    }

    /// Groups `(text, token_count)` pairs into batches of texts alone,
    /// preserving input order, never exceeding either limit. A single
    /// item whose own token count exceeds the budget is placed in its
    /// own batch rather than dropped.
    pub fn batch(&self, items: &[(String, usize)]) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_tokens = 0usize;

        for (text, tokens) in items {
            let would_overflow_len = current.len() + 1 > self.max_batch_len;
            let would_overflow_tokens = current_tokens + tokens > self.max_batch_tokens;
            if !current.is_empty() && (would_overflow_len || would_overflow_tokens) {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push(text.clone());
            current_tokens += tokens;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

/// Serialize a vector of `f32` to little-endian bytes for storage.
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Returns an empty vector for malformed
/// (non-multiple-of-4-byte) input rather than panicking.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`, or `0.0` if either vector has zero
/// magnitude (distinct from "maximally dissimilar").
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0, -2.5, 0.0, 3.25];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_is_zero_not_panic() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 2.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn batcher_respects_len_limit() {
        let batcher = TokenBudgetBatcher::new(2, 10_000);
        let items: Vec<_> = (0..5).map(|i| (format!("chunk{i}"), 1)).collect();
        let batches = batcher.batch(&items);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= 2));
    }

    #[test]
    fn batcher_respects_token_limit() {
        let batcher = TokenBudgetBatcher::new(100, 50);
        let items = vec![
            ("a".to_string(), 30),
            ("b".to_string(), 30),
            ("c".to_string(), 10),
        ];
        let batches = batcher.batch(&items);
        assert_eq!(batches, vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]);
    }

    #[test]
    fn batcher_oversized_item_gets_own_batch() {
        let batcher = TokenBudgetBatcher::new(10, 5);
        let items = vec![("huge".to_string(), 50)];
        let batches = batcher.batch(&items);
        assert_eq!(batches, vec![vec!["huge".to_string()]]);
    }
}
