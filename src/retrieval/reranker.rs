//! Cross-encoder reranking
//!
//! Second-stage scorer over (query, text) pairs. Slower than the dual
//! encoders but more precise; skipped entirely on the emergency fast path.

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),
}

/// Cross-encoder interface. Scores are in [0, 1], position-aligned with the
/// input texts, and deterministic for a fixed (query, batch) pair.
pub trait CrossEncoder: Send + Sync {
    fn score(&self, query: &str, texts: &[String]) -> Vec<f32>;

    fn model_name(&self) -> &str;
}

/// FastEmbed cross-encoder implementation
pub struct FastRerank {
    model: Arc<TextRerank>,
    model_name: String,
    batch_size: usize,
}

impl FastRerank {
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, RerankError> {
        tracing::info!("Initializing reranker model: {}", model_name);

        let init_options =
            RerankInitOptions::new(RerankerModel::BGERerankerBase).with_show_download_progress(true);

        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    /// Map a raw cross-encoder logit into [0, 1]
    fn squash(raw: f32) -> f32 {
        1.0 / (1.0 + (-raw).exp())
    }
}

impl CrossEncoder for FastRerank {
    fn score(&self, query: &str, texts: &[String]) -> Vec<f32> {
        let mut scores = vec![0.0f32; texts.len()];

        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let documents: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();
            let batch_offset = batch_index * self.batch_size;

            match self.model.rerank(query, documents, false, None) {
                Ok(results) => {
                    for result in results {
                        if let Some(slot) = scores.get_mut(batch_offset + result.index) {
                            *slot = Self::squash(result.score);
                        }
                    }
                }
                Err(e) => {
                    // A failed batch scores zero rather than failing the
                    // request; first-stage order is preserved by the blend.
                    tracing::warn!("Reranker batch failed: {}", e);
                }
            }
        }

        scores
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
