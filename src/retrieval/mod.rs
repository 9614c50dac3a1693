//! Hybrid retrieval: dense + sparse + exact match under hierarchy-aware ranking

mod hybrid;
mod precedence;
mod reranker;

pub use hybrid::{HybridRetriever, SearchError, SearchOptions, SearchOutput};
pub use precedence::PrecedenceModel;
pub use reranker::{CrossEncoder, FastRerank, RerankError};

use crate::corpus::{AuthorityTier, Chunk, Domain, SectionKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Query classification label. Ambiguity resolves in this order:
/// emergency > safety > coding > procedure > clinical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Emergency,
    Safety,
    Coding,
    Procedure,
    Clinical,
}

impl QueryClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryClass::Emergency => "emergency",
            QueryClass::Safety => "safety",
            QueryClass::Coding => "coding",
            QueryClass::Procedure => "procedure",
            QueryClass::Clinical => "clinical",
        }
    }

    /// Section kinds that count as a full match for this class
    pub fn matching_sections(self) -> &'static [SectionKind] {
        match self {
            QueryClass::Coding => &[SectionKind::Coding, SectionKind::TableRow],
            QueryClass::Safety => &[SectionKind::Contraindications],
            QueryClass::Procedure => &[SectionKind::Procedure],
            QueryClass::Emergency => &[SectionKind::Procedure, SectionKind::Complications],
            QueryClass::Clinical => &[SectionKind::General, SectionKind::Procedure],
        }
    }
}

/// Which retrievers produced a hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlags {
    pub dense: bool,
    pub sparse: bool,
    pub exact: bool,
}

/// Raw per-source scores before fusion
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScores {
    pub dense: f32,
    pub sparse: f32,
    pub exact: f32,
}

/// One retrieved chunk with scoring detail
#[derive(Debug, Clone)]
pub struct RetrievedHit {
    pub chunk: Arc<Chunk>,
    pub raw: RawScores,
    pub precedence: f32,
    pub final_score: f32,
    pub sources: SourceFlags,
    /// Set when the hit matched an exact CPT token from the query
    pub exact_cpt: bool,
}

impl RetrievedHit {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }
}

/// Post-filters applied to merged candidates. Tightening any field never
/// grows the result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Allowed authority tiers; None allows all
    pub authority_tiers: Option<BTreeSet<AuthorityTier>>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub domain: Option<Domain>,
    pub section_kinds: Option<BTreeSet<SectionKind>>,
    pub has_table: Option<bool>,
    pub has_contraindication: Option<bool>,
    /// Require a has_contraindication or has_dose tag (safety queries)
    #[serde(default)]
    pub require_safety_tags: bool,
}

impl SearchFilters {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(tiers) = &self.authority_tiers {
            if !tiers.contains(&chunk.authority_tier) {
                return false;
            }
        }
        if let Some(min) = self.year_min {
            if chunk.year < min {
                return false;
            }
        }
        if let Some(max) = self.year_max {
            if chunk.year > max {
                return false;
            }
        }
        if let Some(domain) = self.domain {
            if chunk.domain != domain {
                return false;
            }
        }
        if let Some(kinds) = &self.section_kinds {
            if !kinds.contains(&chunk.section_kind) {
                return false;
            }
        }
        if let Some(want) = self.has_table {
            if chunk.tags.has_table != want {
                return false;
            }
        }
        if let Some(want) = self.has_contraindication {
            if chunk.tags.has_contraindication != want {
                return false;
            }
        }
        if self.require_safety_tags
            && !(chunk.tags.has_contraindication || chunk.tags.has_dose)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_fixtures::chunk;

    #[test]
    fn test_filter_matching() {
        let mut c = chunk("c1", "text");
        c.year = 2020;
        c.tags.has_contraindication = true;

        let mut filters = SearchFilters::default();
        assert!(filters.matches(&c));

        filters.year_min = Some(2021);
        assert!(!filters.matches(&c));

        filters.year_min = Some(2019);
        filters.has_contraindication = Some(true);
        assert!(filters.matches(&c));

        filters.authority_tiers = Some([AuthorityTier::A4].into_iter().collect());
        assert!(!filters.matches(&c));
    }

    #[test]
    fn test_safety_tag_filter() {
        let mut filters = SearchFilters::default();
        filters.require_safety_tags = true;

        let mut c = chunk("c1", "text");
        assert!(!filters.matches(&c));

        c.tags.has_dose = true;
        assert!(filters.matches(&c));
    }
}
