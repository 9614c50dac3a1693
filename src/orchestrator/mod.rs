//! Request orchestration: classify -> set_filters -> retrieve -> rerank ->
//! safety_pre -> synthesize -> safety_post
//!
//! One `QueryState` record is threaded through the stages; no shared mutable
//! state between them. The emergency fast path skips reranking and synthesis
//! entirely and renders a canned protocol from A1/A2 evidence.

mod cache;
mod session;

pub use cache::{CacheKey, ResultCache};
pub use session::SessionStore;

use crate::citations::{Citation, CitationResolver};
use crate::config::Config;
use crate::corpus::{AuthorityTier, ChunkStore, Domain};
use crate::error::{IpError, Result};
use crate::llm::{ChatMessage, LlmClient};
use crate::query::{NormalizedQuery, QueryNormalizer};
use crate::retrieval::{
    HybridRetriever, PrecedenceModel, QueryClass, RetrievedHit, SearchError, SearchFilters,
    SearchOptions, SearchOutput,
};
use crate::safety::{emergency_template, SafetyScreen};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Query-path request record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub use_reranker: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
    #[serde(default)]
    pub model: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: default_top_k(),
            use_reranker: true,
            session_id: None,
            filters: None,
            model: None,
        }
    }
}

/// Query-path response record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer_html: String,
    pub citations: Vec<Citation>,
    pub is_emergency: bool,
    pub confidence: f32,
    pub classification: String,
    pub safety_warnings: Vec<String>,
    pub grounding_chunks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_version: Option<String>,
    pub review_required: bool,
}

/// Regex families backing query classification
struct QueryClassifier {
    coding: Regex,
    safety: Regex,
    procedure: Regex,
}

impl QueryClassifier {
    fn new() -> Self {
        Self {
            coding: Regex::new(
                r"\b\d{5}\b|\bcpt\b|\bhcpcs\b|\bbilling\b|\bcoding\b|\brvu\b|\breimbursement\b|\bmodifier\b|\bicd-?10\b",
            )
            .expect("static regex"),
            safety: Regex::new(
                r"contraindicat|\bsafety\b|\brisks?\b|\bcomplications?\b|\bhazard|\bcaution\b|\badverse\b",
            )
            .expect("static regex"),
            procedure: Regex::new(
                r"\btechnique\b|\bsteps\b|\bhow\s+to\b|\bplacement\b|\binsertion\b|\bremoval\b|\bperform\w*\b|\bprocedure\b",
            )
            .expect("static regex"),
        }
    }

    /// Single classification label. Emergency is decided upstream by the
    /// safety screen; among the rest the precedence is
    /// safety > coding > procedure > clinical.
    fn classify(&self, query: &str, is_emergency: bool, known_hazard: bool) -> QueryClass {
        if is_emergency {
            QueryClass::Emergency
        } else if known_hazard || self.safety.is_match(query) {
            QueryClass::Safety
        } else if self.coding.is_match(query) {
            QueryClass::Coding
        } else if self.procedure.is_match(query) {
            QueryClass::Procedure
        } else {
            QueryClass::Clinical
        }
    }
}

/// Per-class retrieval plan
struct FilterPlan {
    filters: SearchFilters,
    top_k: usize,
    use_reranker: bool,
    class: QueryClass,
}

/// Request state threaded through the pipeline stages
struct QueryState {
    normalized: NormalizedQuery,
    class: QueryClass,
    is_emergency: bool,
    warnings: Vec<String>,
}

/// Process-wide orchestrator over immutable, startup-initialized resources
pub struct Orchestrator {
    store: Arc<ChunkStore>,
    retriever: Arc<HybridRetriever>,
    normalizer: QueryNormalizer,
    classifier: QueryClassifier,
    safety: SafetyScreen,
    resolver: CitationResolver,
    precedence: PrecedenceModel,
    llm: Option<Arc<dyn LlmClient>>,
    sessions: SessionStore,
    cache: ResultCache,
    kb_version: Option<String>,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ChunkStore>,
        retriever: Arc<HybridRetriever>,
        resolver: CitationResolver,
        precedence: PrecedenceModel,
        llm: Option<Arc<dyn LlmClient>>,
        config: Config,
    ) -> Result<Self> {
        Ok(Self {
            store,
            retriever,
            normalizer: QueryNormalizer::new(),
            classifier: QueryClassifier::new(),
            safety: SafetyScreen::new(config.safety.clone())?,
            resolver,
            precedence,
            llm,
            sessions: SessionStore::new(&config.session),
            cache: ResultCache::new(&config.cache),
            kb_version: None,
            config,
        })
    }

    /// Attach the coding KB version surfaced on coding-classified responses
    pub fn with_kb_version(mut self, version: impl Into<String>) -> Self {
        self.kb_version = Some(version.into());
        self
    }

    /// Run one query through the full pipeline
    pub async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();

        // classify
        let normalized = self.normalizer.normalize(&request.query, &self.store);
        let pre = self.safety.pre_check(&normalized.text);
        let known_hazard = pre
            .warnings
            .iter()
            .any(|w| w.contains("contraindicated"));
        let class = self
            .classifier
            .classify(&normalized.text, pre.is_emergency, known_hazard);

        let mut state = QueryState {
            normalized,
            class,
            is_emergency: pre.is_emergency,
            warnings: pre.warnings.clone(),
        };

        tracing::info!(
            "Query classified as {} (emergency: {})",
            state.class.as_str(),
            state.is_emergency
        );

        // set_filters
        let plan = self.filter_plan(&request, state.class);

        // retrieve (+ rerank inside the retriever)
        let budget_ms = if state.is_emergency {
            self.config.budget.emergency_ms
        } else {
            self.config.budget.request_ms
        };
        let output = self
            .retrieve_cached(&state.normalized.text, &plan, budget_ms)
            .await?;
        state.warnings.extend(output.warnings.iter().cloned());

        if output.hits.is_empty() {
            return Ok(self.empty_corpus_response(&state, &plan));
        }

        // safety_pre short-circuit: emergency fast path skips synthesis
        if state.is_emergency {
            return Ok(self.emergency_response(&state, &pre, &output));
        }

        // synthesize
        let elapsed = started.elapsed();
        let remaining = Duration::from_millis(budget_ms).saturating_sub(elapsed);
        let draft = self
            .synthesize(&request, &state, &output.hits, remaining)
            .await;

        // safety_post + citations
        let response = match draft {
            Ok(draft_text) => {
                let post = self
                    .safety
                    .post_check(&draft_text, &output.hits, state.class);
                state.warnings.extend(post.warnings.iter().cloned());

                let cited = self.resolver.cited_chunk_ids(&draft_text, &output.hits);
                let citations = self.resolver.resolve(&cited, &output.hits);

                if let Some(session_id) = &request.session_id {
                    self.sessions
                        .record_turn(
                            session_id,
                            ChatMessage::user(state.normalized.raw.clone()),
                            ChatMessage::assistant(draft_text.clone()),
                        )
                        .await;
                }

                self.build_response(&state, &output.hits, citations, draft_text, post.review_required)
            }
            Err(reason) => {
                state.warnings.push(reason);
                self.evidence_only_response(&state, &output.hits)
            }
        };

        Ok(response)
    }

    async fn retrieve_cached(
        &self,
        query: &str,
        plan: &FilterPlan,
        budget_ms: u64,
    ) -> Result<Arc<SearchOutput>> {
        let key = CacheKey {
            query: query.to_string(),
            filters: plan.filters.clone(),
            use_reranker: plan.use_reranker,
        };

        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!("Result cache hit");
            return Ok(cached);
        }

        let mut opts = SearchOptions::new(plan.top_k, plan.class);
        opts.filters = plan.filters.clone();
        opts.use_reranker = plan.use_reranker;
        opts.dense_budget = Some(Duration::from_millis(budget_ms / 2));

        let output = match self.retriever.search(query, &opts).await {
            Ok(output) => output,
            Err(SearchError::Unavailable) => return Err(IpError::RetrievalUnavailable),
            Err(e) => return Err(IpError::Other(anyhow::anyhow!(e))),
        };

        let output = Arc::new(output);
        self.cache.insert(key, output.clone());
        Ok(output)
    }

    fn filter_plan(&self, request: &QueryRequest, class: QueryClass) -> FilterPlan {
        let mut filters = request.filters.clone().unwrap_or_default();
        let mut top_k = request.top_k.clamp(1, 50);
        let mut use_reranker =
            request.use_reranker && self.config.retrieval.reranker.enabled;

        match class {
            QueryClass::Emergency => {
                filters.authority_tiers = Some(
                    [AuthorityTier::A1, AuthorityTier::A2]
                        .into_iter()
                        .collect(),
                );
                top_k = top_k.min(5);
                use_reranker = false;
            }
            QueryClass::Coding => {
                filters.domain = Some(Domain::CodingBilling);
            }
            QueryClass::Safety => {
                filters.require_safety_tags = true;
            }
            QueryClass::Procedure | QueryClass::Clinical => {}
        }

        FilterPlan {
            filters,
            top_k,
            use_reranker,
            class,
        }
    }

    async fn synthesize(
        &self,
        request: &QueryRequest,
        state: &QueryState,
        hits: &[RetrievedHit],
        budget: Duration,
    ) -> std::result::Result<String, String> {
        let Some(llm) = &self.llm else {
            return Err("llm_unavailable: no generator configured".to_string());
        };

        let mut messages = vec![ChatMessage::system(
            "You are an expert interventional pulmonology assistant. Answer only from the \
             provided context. Cite every claim inline with the chunk id in square brackets, \
             e.g. [papoip:ch12:004]. If the context does not support an answer, say so \
             explicitly. Never give dosing guidance without a citation.",
        )];

        if let Some(session_id) = &request.session_id {
            messages.extend(self.sessions.history(session_id).await);
        }

        let mut context = String::new();
        for hit in hits {
            context.push_str(&format!(
                "[{}] ({:?} {} {}) {}\n\n",
                hit.chunk_id(),
                hit.chunk.authority_tier,
                hit.chunk.year,
                hit.chunk.doc_id,
                hit.chunk.text
            ));
        }
        messages.push(ChatMessage::user(format!(
            "Context:\n{}\nQuestion: {}",
            context, state.normalized.text
        )));

        let generation = tokio::time::timeout(
            budget,
            llm.generate(&messages, None, self.config.llm.max_output_tokens),
        )
        .await;

        match generation {
            Ok(Ok(generation)) => Ok(generation.text),
            Ok(Err(e)) => Err(format!("llm_unavailable: {}", e)),
            Err(_) => Err(format!(
                "llm_timeout: synthesis exceeded {} ms",
                budget.as_millis()
            )),
        }
    }

    fn emergency_response(
        &self,
        state: &QueryState,
        pre: &crate::safety::PreCheck,
        output: &SearchOutput,
    ) -> QueryResponse {
        let kind = pre.emergency_kind.as_deref().unwrap_or("emergency");
        let template = emergency_template(kind, &output.hits);

        let cited: Vec<String> = output
            .hits
            .iter()
            .map(|h| h.chunk_id().to_string())
            .collect();
        let citations = self.resolver.resolve(&cited, &output.hits);

        let mut warnings = state.warnings.clone();
        warnings.extend(CitationResolver::stale_coding_warnings(
            &output.hits,
            &self.precedence,
        ));

        QueryResponse {
            answer_html: render_preformatted(&template),
            citations,
            is_emergency: true,
            confidence: confidence_from(&output.hits),
            classification: state.class.as_str().to_string(),
            safety_warnings: warnings,
            grounding_chunks: cited,
            kb_version: None,
            review_required: false,
        }
    }

    fn empty_corpus_response(&self, state: &QueryState, plan: &FilterPlan) -> QueryResponse {
        let mut relaxations = Vec::new();
        if plan.filters.authority_tiers.is_some() {
            relaxations.push("authority_tier");
        }
        if plan.filters.domain.is_some() {
            relaxations.push("domain");
        }
        if plan.filters.section_kinds.is_some() {
            relaxations.push("section_kind");
        }
        if plan.filters.require_safety_tags {
            relaxations.push("safety tags");
        }
        if plan.filters.year_min.is_some() || plan.filters.year_max.is_some() {
            relaxations.push("year range");
        }

        let mut warnings = state.warnings.clone();
        warnings.push(if relaxations.is_empty() {
            "empty_corpus_for_query: no chunks matched the query".to_string()
        } else {
            format!(
                "empty_corpus_for_query: no chunks passed filters; consider relaxing {}",
                relaxations.join(", ")
            )
        });

        QueryResponse {
            answer_html: "<p>No evidence in the corpus matched this query under the active \
                          filters.</p>"
                .to_string(),
            citations: Vec::new(),
            is_emergency: state.is_emergency,
            confidence: 0.0,
            classification: state.class.as_str().to_string(),
            safety_warnings: warnings,
            grounding_chunks: Vec::new(),
            kb_version: None,
            review_required: false,
        }
    }

    /// Structured fallback when synthesis is unavailable or over budget:
    /// ordered grounding chunks with citations and no generated prose
    fn evidence_only_response(&self, state: &QueryState, hits: &[RetrievedHit]) -> QueryResponse {
        let cited: Vec<String> = hits.iter().map(|h| h.chunk_id().to_string()).collect();
        let citations = self.resolver.resolve(&cited, hits);

        let mut body = String::from("<p>Evidence summary (no synthesized answer):</p><ol>");
        for hit in hits {
            body.push_str(&format!(
                "<li><strong>[{}]</strong> {}</li>",
                escape_html(hit.chunk_id()),
                escape_html(truncate(&hit.chunk.text, 400))
            ));
        }
        body.push_str("</ol>");

        let mut warnings = state.warnings.clone();
        warnings.extend(CitationResolver::stale_coding_warnings(
            hits,
            &self.precedence,
        ));

        QueryResponse {
            answer_html: body,
            citations,
            is_emergency: false,
            confidence: confidence_from(hits) * 0.8,
            classification: state.class.as_str().to_string(),
            safety_warnings: warnings,
            grounding_chunks: cited,
            kb_version: self.kb_version_for(state.class),
            review_required: false,
        }
    }

    fn build_response(
        &self,
        state: &QueryState,
        hits: &[RetrievedHit],
        citations: Vec<Citation>,
        draft: String,
        review_required: bool,
    ) -> QueryResponse {
        let grounding: Vec<String> = hits.iter().map(|h| h.chunk_id().to_string()).collect();

        let mut warnings = state.warnings.clone();
        warnings.extend(CitationResolver::stale_coding_warnings(
            hits,
            &self.precedence,
        ));

        let references = CitationResolver::format_references(&citations);
        let mut answer_html = render_paragraphs(&draft);
        if !references.is_empty() {
            answer_html.push_str("<h4>References</h4>");
            answer_html.push_str(&render_preformatted(&references));
        }

        QueryResponse {
            answer_html,
            citations,
            is_emergency: false,
            confidence: confidence_from(hits),
            classification: state.class.as_str().to_string(),
            safety_warnings: warnings,
            grounding_chunks: grounding,
            kb_version: self.kb_version_for(state.class),
            review_required,
        }
    }

    fn kb_version_for(&self, class: QueryClass) -> Option<String> {
        if class == QueryClass::Coding {
            self.kb_version.clone()
        } else {
            None
        }
    }
}

/// Mean of the top-3 final scores, clamped into [0, 1]
fn confidence_from(hits: &[RetrievedHit]) -> f32 {
    if hits.is_empty() {
        return 0.0;
    }
    let top = &hits[..hits.len().min(3)];
    let mean = top.iter().map(|h| h.final_score).sum::<f32>() / top.len() as f32;
    mean.clamp(0.0, 1.0)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_paragraphs(text: &str) -> String {
    text.split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p.trim())))
        .collect()
}

fn render_preformatted(text: &str) -> String {
    format!("<pre>{}</pre>", escape_html(text))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_precedence() {
        let c = QueryClassifier::new();

        // Safety beats coding when both match
        assert_eq!(
            c.classify("contraindications for cpt 31622", false, false),
            QueryClass::Safety
        );
        assert_eq!(
            c.classify("cpt 31622 billing", false, false),
            QueryClass::Coding
        );
        assert_eq!(
            c.classify("stent placement technique", false, false),
            QueryClass::Procedure
        );
        assert_eq!(
            c.classify("follow-up interval after ablation", false, false),
            QueryClass::Clinical
        );
        // Emergency wins over everything
        assert_eq!(
            c.classify("contraindications for cpt 31622", true, false),
            QueryClass::Emergency
        );
        // Known hazard forces safety handling
        assert_eq!(
            c.classify("sems benign stenosis", false, true),
            QueryClass::Safety
        );
    }

    #[test]
    fn test_request_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"query": "q"}"#).unwrap();
        assert_eq!(request.top_k, 5);
        assert!(request.use_reranker);
        assert!(request.session_id.is_none());
    }

    #[test]
    fn test_render_paragraphs_escapes() {
        let html = render_paragraphs("a < b\n\nsecond");
        assert_eq!(html, "<p>a &lt; b</p><p>second</p>");
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("αβγδ", 2), "αβ");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
