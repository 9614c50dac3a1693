//! Dense KNN interface and in-process HNSW implementation
//!
//! The retriever only depends on the `DenseStore` trait; the HNSW-backed
//! implementation below embeds the corpus at startup. A remote vector store
//! can be swapped in behind the same trait.

use crate::config::EmbeddingConfig;
use crate::corpus::{Chunk, ChunkStore};
use crate::index::{Embedder, EmbeddingError};
use hnsw_rs::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DenseError {
    #[error("Index build failed: {0}")]
    BuildError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Dense backend unavailable: {0}")]
    Unavailable(String),
}

/// One KNN hit with full chunk payload
#[derive(Debug, Clone)]
pub struct DenseHit {
    pub chunk_id: String,
    /// Cosine similarity in [0, 1]
    pub score: f32,
    pub chunk: Option<Arc<Chunk>>,
}

/// KNN store interface: `knn_search(vector, k)` with payload
pub trait DenseStore: Send + Sync {
    fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<DenseHit>, DenseError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process HNSW index over the chunk corpus
///
/// Uses cosine distance on the embedder's article vectors. Internal numeric
/// ids map back to chunk ids.
pub struct HnswDenseStore {
    index: Hnsw<'static, f32, DistCosine>,
    payloads: HashMap<usize, Arc<Chunk>>,
    dimension: usize,
    ef_search: usize,
}

impl HnswDenseStore {
    /// Embed every chunk and build the index
    pub fn build(
        store: &ChunkStore,
        embedder: &dyn Embedder,
        config: &EmbeddingConfig,
    ) -> Result<Self, DenseError> {
        let chunks: Vec<Arc<Chunk>> = store.iter().cloned().collect();
        let dimension = embedder.dimension();

        let index = Hnsw::<f32, DistCosine>::new(
            config.hnsw_m,
            chunks.len().max(1),
            16, // max_layer
            config.hnsw_ef_construction,
            DistCosine,
        );

        let mut payloads = HashMap::with_capacity(chunks.len());

        for (batch_start, batch) in chunks.chunks(config.batch_size).enumerate().map(|(i, b)| {
            (i * config.batch_size, b)
        }) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.encode_articles(&texts)?;

            for (offset, vector) in vectors.into_iter().enumerate() {
                if vector.len() != dimension {
                    return Err(DenseError::InvalidDimension {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                let internal_id = batch_start + offset;
                index.insert((&vector, internal_id));
                payloads.insert(internal_id, batch[offset].clone());
            }
        }

        tracing::info!(
            "Dense index built: {} vectors ({}D, model {})",
            payloads.len(),
            dimension,
            embedder.model_name()
        );

        Ok(Self {
            index,
            payloads,
            dimension,
            ef_search: config.hnsw_ef_construction.min(200),
        })
    }
}

impl DenseStore for HnswDenseStore {
    fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<DenseHit>, DenseError> {
        if vector.len() != self.dimension {
            return Err(DenseError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let neighbors = self.index.search(vector, k, self.ef_search);

        Ok(neighbors
            .into_iter()
            .filter_map(|n| {
                let chunk = self.payloads.get(&n.d_id)?;
                Some(DenseHit {
                    chunk_id: chunk.chunk_id.clone(),
                    // Cosine distance to similarity, clamped to [0, 1]
                    score: (1.0 - n.distance).clamp(0.0, 1.0),
                    chunk: Some(chunk.clone()),
                })
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.payloads.len()
    }
}
