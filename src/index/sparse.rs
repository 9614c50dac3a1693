//! In-memory BM25 index over chunk text
//!
//! Thin wrapper around an in-RAM tantivy index. Raw BM25 scores come back
//! unnormalized; the hybrid retriever normalizes per query by the top-1 hit.

use crate::corpus::ChunkStore;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, ReloadPolicy, TantivyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SparseIndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Tantivy error: {0}")]
    TantivyError(#[from] TantivyError),

    #[error("Query parsing error: {0}")]
    QueryParseError(String),
}

/// One BM25 hit
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub chunk_id: String,
    /// Raw BM25 score, unnormalized
    pub score: f32,
}

/// In-RAM BM25 index over the chunk corpus
pub struct SparseIndex {
    index: Index,
    reader: IndexReader,
    id_field: tantivy::schema::Field,
    text_field: tantivy::schema::Field,
    doc_count: usize,
}

impl SparseIndex {
    /// Build the index from the chunk store
    pub fn build(store: &ChunkStore) -> Result<Self, SparseIndexError> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);

        let mut writer = index
            .writer(50_000_000)
            .map_err(|e| SparseIndexError::InitializationError(e.to_string()))?;

        let mut doc_count = 0;
        for chunk in store.iter() {
            writer
                .add_document(doc!(
                    id_field => chunk.chunk_id.clone(),
                    text_field => chunk.text.clone(),
                ))
                .map_err(|e| SparseIndexError::InsertError(e.to_string()))?;
            doc_count += 1;
        }

        writer
            .commit()
            .map_err(|e| SparseIndexError::InsertError(e.to_string()))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e: TantivyError| SparseIndexError::InitializationError(e.to_string()))?;
        reader
            .reload()
            .map_err(|e| SparseIndexError::InitializationError(e.to_string()))?;

        tracing::info!("Sparse index built: {} documents", doc_count);

        Ok(Self {
            index,
            reader,
            id_field,
            text_field,
            doc_count,
        })
    }

    /// BM25 top-`limit` search. Lenient parsing: query punctuation that is
    /// not valid tantivy syntax is dropped rather than failing the request.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SparseHit>, SparseIndexError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let (parsed, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!("Lenient sparse parse dropped fragments: {:?}", errors);
        }

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .map_err(|e| SparseIndexError::SearchError(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let retrieved: tantivy::TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| SparseIndexError::SearchError(e.to_string()))?;

            let chunk_id = retrieved
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    SparseIndexError::SearchError("Missing chunk_id field".to_string())
                })?
                .to_string();

            results.push(SparseHit { chunk_id, score });
        }

        Ok(results)
    }

    pub fn len(&self) -> usize {
        self.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }
}
