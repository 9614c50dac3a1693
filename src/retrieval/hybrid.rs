//! Hybrid retriever: dense + sparse + exact match, fused under the
//! hierarchy-aware ranking function
//!
//! Dense and sparse retrieval run concurrently; exact lookups are cheap and
//! run inline. Candidates merge by chunk id, score per §4.2, pass the
//! post-filters, then optionally go through the cross-encoder.

use crate::config::RetrievalConfig;
use crate::corpus::{ChunkStore, Domain, TermIndex};
use crate::index::{DenseStore, Embedder, SparseIndex};
use crate::retrieval::{
    CrossEncoder, PrecedenceModel, QueryClass, RawScores, RetrievedHit, SearchFilters, SourceFlags,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Retrieval unavailable: dense and sparse backends are both down")]
    Unavailable,

    #[error("Retrieval task failed: {0}")]
    TaskFailed(String),
}

/// Per-search options
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub class: QueryClass,
    pub filters: SearchFilters,
    pub use_reranker: bool,
    /// Budget for the dense call; on expiry the search degrades to
    /// sparse + exact instead of failing
    pub dense_budget: Option<Duration>,
}

impl SearchOptions {
    pub fn new(k: usize, class: QueryClass) -> Self {
        Self {
            k,
            class,
            filters: SearchFilters::default(),
            use_reranker: true,
            dense_budget: None,
        }
    }
}

/// Search result set with degradation detail
#[derive(Debug, Clone, Default)]
pub struct SearchOutput {
    pub hits: Vec<RetrievedHit>,
    pub warnings: Vec<String>,
    pub degraded: bool,
}

/// Per-candidate accumulator during the merge
#[derive(Default)]
struct Candidate {
    raw: RawScores,
    sources: SourceFlags,
    exact_cpt: bool,
}

/// Process-wide retriever over immutable indexes
pub struct HybridRetriever {
    store: Arc<ChunkStore>,
    terms: Arc<TermIndex>,
    sparse: Option<Arc<SparseIndex>>,
    dense: Option<Arc<dyn DenseStore>>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn CrossEncoder>>,
    precedence: PrecedenceModel,
    config: RetrievalConfig,
    cpt_token: Regex,
}

impl HybridRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkStore>,
        terms: Arc<TermIndex>,
        sparse: Option<Arc<SparseIndex>>,
        dense: Option<Arc<dyn DenseStore>>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn CrossEncoder>>,
        precedence: PrecedenceModel,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            terms,
            sparse,
            dense,
            embedder,
            reranker,
            precedence,
            config,
            cpt_token: Regex::new(r"\b\d{5}\b").expect("static regex"),
        }
    }

    /// Hybrid search over the normalized query text
    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<SearchOutput, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery(
                "Query text cannot be empty".to_string(),
            ));
        }
        if opts.k == 0 || opts.k > 50 {
            return Err(SearchError::InvalidQuery(format!(
                "k must be in 1..=50, got {}",
                opts.k
            )));
        }

        if self.dense.is_none() && self.sparse.is_none() {
            return Err(SearchError::Unavailable);
        }

        let m = self.config.top_m.max(3 * opts.k);
        let mut warnings = Vec::new();
        let mut degraded = false;

        // Dense and sparse run as two cooperative tasks, joined before merge
        let (dense_hits, sparse_hits) = tokio::join!(
            self.dense_task(query, m, opts.dense_budget),
            self.sparse_task(query, m),
        );

        let dense_hits = match dense_hits {
            Some(Ok(hits)) => Some(hits),
            Some(Err(message)) => {
                tracing::warn!("Dense retrieval degraded: {}", message);
                warnings.push(format!("retrieval_degraded: {}", message));
                degraded = true;
                None
            }
            None => None,
        };

        let sparse_hits = match sparse_hits {
            Some(Ok(hits)) => Some(hits),
            Some(Err(message)) => {
                tracing::warn!("Sparse retrieval degraded: {}", message);
                warnings.push(format!("retrieval_degraded: {}", message));
                degraded = true;
                None
            }
            None => None,
        };

        if dense_hits.is_none() && sparse_hits.is_none() {
            return Err(SearchError::Unavailable);
        }

        // Merge by chunk id, per-source max, union of source flags
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        if let Some(hits) = dense_hits {
            for hit in hits {
                let entry = candidates.entry(hit.chunk_id).or_default();
                entry.raw.dense = entry.raw.dense.max(hit.score.clamp(0.0, 1.0));
                entry.sources.dense = true;
            }
        }

        if let Some(hits) = sparse_hits {
            let top = hits.first().map(|h| h.score).unwrap_or(0.0);
            if top > 0.0 {
                for hit in hits {
                    let entry = candidates.entry(hit.chunk_id).or_default();
                    entry.raw.sparse = entry.raw.sparse.max(hit.score / top);
                    entry.sources.sparse = true;
                }
            }
        }

        let (exact_ids, exact_cpt_ids) = self.exact_lookup(query);
        for chunk_id in &exact_ids {
            let entry = candidates.entry(chunk_id.clone()).or_default();
            entry.raw.exact = 1.0;
            entry.sources.exact = true;
            entry.exact_cpt |= exact_cpt_ids.contains(chunk_id);
        }

        // Score, post-filter, and hydrate from the store
        let mut hits: Vec<RetrievedHit> = candidates
            .into_iter()
            .filter_map(|(chunk_id, candidate)| {
                let chunk = self.store.get(&chunk_id)?;
                if !opts.filters.matches(&chunk) {
                    return None;
                }
                Some(self.score_candidate(chunk, candidate, opts.class))
            })
            .collect();

        sort_hits(&mut hits);
        self.precedence.apply_standard_of_care_guard(&mut hits);

        if opts.use_reranker {
            if let Some(reranker) = &self.reranker {
                hits = self.rerank(query, hits, reranker.as_ref());
                // The blend can reorder; the guard must hold on final order
                self.precedence.apply_standard_of_care_guard(&mut hits);
            }
        }

        hits.truncate(opts.k);

        Ok(SearchOutput {
            hits,
            warnings,
            degraded,
        })
    }

    /// Dense retrieval on the blocking pool, bounded by the budget.
    /// Returns None when no dense backend is configured.
    async fn dense_task(
        &self,
        query: &str,
        m: usize,
        budget: Option<Duration>,
    ) -> Option<Result<Vec<crate::index::DenseHit>, String>> {
        let dense = self.dense.clone()?;
        let embedder = self.embedder.clone();
        let text = query.to_string();

        let task = tokio::task::spawn_blocking(move || {
            let vector = embedder
                .encode_query(&text)
                .map_err(|e| format!("query encoding failed: {}", e))?;
            dense
                .knn_search(&vector, m)
                .map_err(|e| format!("dense KNN failed: {}", e))
        });

        let joined = match budget {
            Some(budget) => match tokio::time::timeout(budget, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Some(Err(format!(
                        "dense retrieval exceeded {} ms budget",
                        budget.as_millis()
                    )))
                }
            },
            None => task.await,
        };

        Some(joined.unwrap_or_else(|e| Err(format!("dense task panicked: {}", e))))
    }

    async fn sparse_task(
        &self,
        query: &str,
        m: usize,
    ) -> Option<Result<Vec<crate::index::SparseHit>, String>> {
        let sparse = self.sparse.clone()?;
        let text = query.to_string();

        let task = tokio::task::spawn_blocking(move || {
            sparse
                .search(&text, m)
                .map_err(|e| format!("sparse search failed: {}", e))
        });

        Some(task.await.unwrap_or_else(|e| {
            Err(format!("sparse task panicked: {}", e))
        }))
    }

    /// Exact retrieval: CPT tokens and alias substrings of the query.
    /// Returns (all exact ids, ids that matched via a CPT code).
    fn exact_lookup(&self, query: &str) -> (HashSet<String>, HashSet<String>) {
        let mut ids = HashSet::new();
        let mut cpt_ids = HashSet::new();

        for token in self.cpt_token.find_iter(query) {
            if let Some(chunk_ids) = self.terms.by_cpt(token.as_str()) {
                for id in chunk_ids {
                    ids.insert(id.clone());
                    cpt_ids.insert(id.clone());
                }
            }
        }

        let query_lower = query.to_lowercase();
        for alias in self.terms.aliases() {
            if query_lower.contains(alias.as_str()) {
                if let Some(chunk_ids) = self.terms.by_alias(alias) {
                    ids.extend(chunk_ids.iter().cloned());
                }
            }
        }

        (ids, cpt_ids)
    }

    fn score_candidate(
        &self,
        chunk: Arc<crate::corpus::Chunk>,
        candidate: Candidate,
        class: QueryClass,
    ) -> RetrievedHit {
        let precedence = self.precedence.precedence(&chunk);
        let semantic = candidate.raw.dense.max(candidate.raw.sparse);
        let section = if class.matching_sections().contains(&chunk.section_kind) {
            1.0
        } else {
            0.5
        };
        let entity = if candidate.sources.exact { 1.0 } else { 0.0 };

        let mut final_score = self.config.precedence_weight * precedence
            + self.config.semantic_weight * semantic
            + self.config.section_weight * section
            + self.config.entity_weight * entity;

        if candidate.exact_cpt {
            final_score += self.config.cpt_bonus;
        }
        if class == QueryClass::Coding && chunk.domain == Domain::CodingBilling {
            final_score += self.config.coding_domain_bonus;
        }

        RetrievedHit {
            chunk,
            raw: candidate.raw,
            precedence,
            final_score,
            sources: candidate.sources,
            exact_cpt: candidate.exact_cpt,
        }
    }

    /// Cross-encoder pass over the head of the candidate list
    fn rerank(
        &self,
        query: &str,
        mut hits: Vec<RetrievedHit>,
        reranker: &dyn CrossEncoder,
    ) -> Vec<RetrievedHit> {
        let head_len = self.config.reranker.candidates.min(hits.len());
        if head_len < 2 {
            return hits;
        }

        let tail = hits.split_off(head_len);
        let texts: Vec<String> = hits.iter().map(|h| h.chunk.text.clone()).collect();
        let scores = reranker.score(query, &texts);

        let blend = self.config.reranker.blend;
        for (hit, ce_score) in hits.iter_mut().zip(scores) {
            hit.final_score = blend * hit.final_score + (1.0 - blend) * ce_score;
        }

        sort_hits(&mut hits);
        hits.extend(tail);
        hits
    }
}

/// Descending score with the deterministic tie-break chain: higher authority
/// tier, more recent year, shorter text, chunk_id lexicographic
fn sort_hits(hits: &mut [RetrievedHit]) {
    hits.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.authority_tier.rank().cmp(&b.chunk.authority_tier.rank()))
            .then_with(|| b.chunk.year.cmp(&a.chunk.year))
            .then_with(|| a.chunk.text.len().cmp(&b.chunk.text.len()))
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, PrecedenceConfig};
    use crate::corpus::test_fixtures::chunk;
    use crate::corpus::{AuthorityTier, Chunk, SectionKind};
    use crate::index::mock::{FailingDenseStore, MockEmbedder};
    use crate::index::HnswDenseStore;

    fn corpus() -> Vec<Chunk> {
        let mut fiducial = chunk("fid-1", "fiducial marker placement uses 3-6 markers spaced 1.5-5 cm apart in a non-collinear arrangement");
        fiducial.aliases.insert("fiducial marker".to_string());
        fiducial.section_kind = SectionKind::Procedure;

        let mut coding = chunk(
            "code-1",
            "diagnostic bronchoscopy is reported with CPT 31622",
        );
        coding.cpt_codes.insert("31622".to_string());
        coding.domain = Domain::CodingBilling;
        coding.section_kind = SectionKind::Coding;
        coding.authority_tier = AuthorityTier::A2;

        let mut pleural = chunk("ple-1", "pleural effusion drainage with small-bore catheter");
        pleural.section_kind = SectionKind::General;

        vec![fiducial, coding, pleural]
    }

    fn retriever(dense_up: bool, sparse_up: bool) -> HybridRetriever {
        let store = Arc::new(ChunkStore::from_chunks(corpus()).unwrap());
        let terms = Arc::new(TermIndex::build(&store));
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new());

        let dense: Option<Arc<dyn DenseStore>> = if dense_up {
            Some(Arc::new(
                HnswDenseStore::build(&store, &MockEmbedder::new(), &EmbeddingConfig::default())
                    .unwrap(),
            ))
        } else {
            None
        };

        let sparse = if sparse_up {
            Some(Arc::new(SparseIndex::build(&store).unwrap()))
        } else {
            None
        };

        HybridRetriever::new(
            store,
            terms,
            sparse,
            dense,
            embedder,
            None,
            PrecedenceModel::new(PrecedenceConfig::default(), 2025),
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_exact_cpt_in_top_results() {
        let r = retriever(true, true);
        let opts = SearchOptions::new(5, QueryClass::Coding);
        let out = r.search("cpt 31622", &opts).await.unwrap();

        assert!(!out.hits.is_empty());
        assert_eq!(out.hits[0].chunk_id(), "code-1");
        assert!(out.hits[0].sources.exact);
        assert!(out.hits[0].exact_cpt);
    }

    #[tokio::test]
    async fn test_alias_exact_match() {
        let r = retriever(true, true);
        let opts = SearchOptions::new(5, QueryClass::Procedure);
        let out = r
            .search("fiducial marker placement requirements", &opts)
            .await
            .unwrap();

        assert_eq!(out.hits[0].chunk_id(), "fid-1");
        assert!(out.hits[0].sources.exact);
        assert!(!out.hits[0].exact_cpt);
    }

    #[tokio::test]
    async fn test_final_score_bounds() {
        let r = retriever(true, true);
        let opts = SearchOptions::new(5, QueryClass::Coding);
        let out = r.search("cpt 31622 bronchoscopy", &opts).await.unwrap();

        for hit in &out.hits {
            assert!((0.0..=2.0).contains(&hit.final_score));
            assert!((0.0..=1.0).contains(&hit.precedence));
            assert!(r.store.contains(hit.chunk_id()));
        }
    }

    #[tokio::test]
    async fn test_deterministic_without_reranker() {
        let r = retriever(true, true);
        let mut opts = SearchOptions::new(5, QueryClass::Clinical);
        opts.use_reranker = false;

        let a = r.search("pleural drainage", &opts).await.unwrap();
        let b = r.search("pleural drainage", &opts).await.unwrap();

        let ids_a: Vec<&str> = a.hits.iter().map(|h| h.chunk_id()).collect();
        let ids_b: Vec<&str> = b.hits.iter().map(|h| h.chunk_id()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn test_filter_monotonicity() {
        let r = retriever(true, true);
        let loose = SearchOptions::new(10, QueryClass::Clinical);
        let out_loose = r.search("bronchoscopy placement", &loose).await.unwrap();

        let mut tight = loose.clone();
        tight.filters.authority_tiers =
            Some([AuthorityTier::A2].into_iter().collect());
        let out_tight = r.search("bronchoscopy placement", &tight).await.unwrap();

        assert!(out_tight.hits.len() <= out_loose.hits.len());
        let loose_ids: HashSet<&str> =
            out_loose.hits.iter().map(|h| h.chunk_id()).collect();
        for hit in &out_tight.hits {
            assert!(loose_ids.contains(hit.chunk_id()));
        }
    }

    #[tokio::test]
    async fn test_degraded_dense_falls_back() {
        let store = Arc::new(ChunkStore::from_chunks(corpus()).unwrap());
        let terms = Arc::new(TermIndex::build(&store));
        let r = HybridRetriever::new(
            store.clone(),
            terms,
            Some(Arc::new(SparseIndex::build(&store).unwrap())),
            Some(Arc::new(FailingDenseStore)),
            Arc::new(MockEmbedder::new()),
            None,
            PrecedenceModel::new(PrecedenceConfig::default(), 2025),
            RetrievalConfig::default(),
        );

        let opts = SearchOptions::new(5, QueryClass::Clinical);
        let out = r.search("pleural effusion drainage", &opts).await.unwrap();

        assert!(out.degraded);
        assert!(out
            .warnings
            .iter()
            .any(|w| w.starts_with("retrieval_degraded")));
        assert!(!out.hits.is_empty());
    }

    #[tokio::test]
    async fn test_both_backends_down_is_hard_failure() {
        let r = retriever(false, false);
        let opts = SearchOptions::new(5, QueryClass::Clinical);
        let result = r.search("anything", &opts).await;
        assert!(matches!(result, Err(SearchError::Unavailable)));
    }

    #[tokio::test]
    async fn test_invalid_k() {
        let r = retriever(true, true);
        let opts = SearchOptions::new(0, QueryClass::Clinical);
        assert!(matches!(
            r.search("query", &opts).await,
            Err(SearchError::InvalidQuery(_))
        ));
    }
}
