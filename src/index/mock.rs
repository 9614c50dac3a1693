//! Deterministic mock backends for tests
//!
//! The real encoder, reranker, and LLM need model downloads or network
//! access; tests run against these instead. All mocks are pure functions of
//! their input.

use crate::index::{DenseError, DenseHit, DenseStore, Embedder, EmbeddingError};
use crate::retrieval::CrossEncoder;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

const MOCK_DIMENSION: usize = 64;

/// Hashed bag-of-words embedder. Token overlap drives cosine similarity,
/// which is enough to make ranking assertions meaningful.
pub struct MockEmbedder;

impl MockEmbedder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; MOCK_DIMENSION];
        for token in text.to_lowercase().split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % MOCK_DIMENSION;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for MockEmbedder {
    fn encode_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty query".to_string()));
        }
        Ok(self.embed(text))
    }

    fn encode_articles(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        MOCK_DIMENSION
    }

    fn model_name(&self) -> &str {
        "mock-bag-of-words"
    }
}

/// Dense store that always fails, for degraded-mode tests
pub struct FailingDenseStore;

impl DenseStore for FailingDenseStore {
    fn knn_search(&self, _vector: &[f32], _k: usize) -> Result<Vec<DenseHit>, DenseError> {
        Err(DenseError::Unavailable("mock outage".to_string()))
    }

    fn len(&self) -> usize {
        0
    }
}

/// Token-overlap cross-encoder: |q ∩ d| / |q|, deterministic per pair
pub struct MockCrossEncoder;

impl CrossEncoder for MockCrossEncoder {
    fn score(&self, query: &str, texts: &[String]) -> Vec<f32> {
        let query_tokens: HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|t| !t.is_empty())
            .collect();

        texts
            .iter()
            .map(|text| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let doc_tokens: HashSet<String> = text
                    .to_lowercase()
                    .split_whitespace()
                    .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                let overlap = query_tokens.intersection(&doc_tokens).count();
                overlap as f32 / query_tokens.len() as f32
            })
            .collect()
    }

    fn model_name(&self) -> &str {
        "mock-token-overlap"
    }
}
