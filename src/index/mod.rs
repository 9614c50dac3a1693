//! Derived indexes: sparse BM25, dense KNN, and the embedding interface
//!
//! All indexes are built synchronously at startup and read-only afterwards.

mod dense;
mod embedder;
pub mod mock;
mod sparse;

pub use dense::{DenseError, DenseHit, DenseStore, HnswDenseStore};
pub use embedder::{Embedder, EmbeddingError, FastEmbedder};
pub use sparse::{SparseHit, SparseIndex, SparseIndexError};
