//! Corpus data model and chunk store
//!
//! Chunks are produced once by the ingestion collaborator and arrive as a
//! newline-delimited JSON stream. The store is immutable for the lifetime of
//! the process; every index is derived from it at startup.

mod term_index;

pub use term_index::TermIndex;

use crate::error::{IpError, Result};
use crate::text::TextNormalizer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

/// Authority tier assigned per document at ingestion. A1 is the current
/// flagship textbook; A4 is a journal article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthorityTier {
    A1,
    A2,
    A3,
    A4,
}

impl AuthorityTier {
    /// Rank for ordering: lower is more authoritative
    pub fn rank(self) -> u8 {
        match self {
            AuthorityTier::A1 => 0,
            AuthorityTier::A2 => 1,
            AuthorityTier::A3 => 2,
            AuthorityTier::A4 => 3,
        }
    }

    /// Authority component of the precedence score
    pub fn weight(self) -> f32 {
        match self {
            AuthorityTier::A1 => 1.0,
            AuthorityTier::A2 => 0.85,
            AuthorityTier::A3 => 0.7,
            AuthorityTier::A4 => 0.6,
        }
    }
}

/// Evidence level. H1 is the strongest (guideline / systematic review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceLevel {
    H1,
    H2,
    H3,
    H4,
}

impl EvidenceLevel {
    pub fn weight(self) -> f32 {
        match self {
            EvidenceLevel::H1 => 1.0,
            EvidenceLevel::H2 => 0.9,
            EvidenceLevel::H3 => 0.75,
            EvidenceLevel::H4 => 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Guideline,
    SystematicReview,
    Rct,
    Cohort,
    NarrativeReview,
    BookChapter,
    Case,
    JournalArticle,
}

impl DocType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocType::Guideline => "guideline",
            DocType::SystematicReview => "systematic_review",
            DocType::Rct => "rct",
            DocType::Cohort => "cohort",
            DocType::NarrativeReview => "narrative_review",
            DocType::BookChapter => "book_chapter",
            DocType::Case => "case",
            DocType::JournalArticle => "journal_article",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Procedure,
    Complications,
    Contraindications,
    Coding,
    Ablation,
    Blvr,
    General,
    TableRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Clinical,
    CodingBilling,
    Ablation,
    LungVolumeReduction,
    TechnologyNavigation,
}

/// Content tags set during ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTags {
    #[serde(default)]
    pub has_table: bool,
    #[serde(default)]
    pub has_contraindication: bool,
    #[serde(default)]
    pub has_dose: bool,
    #[serde(default)]
    pub has_emergency_pattern: bool,
}

/// The atomic unit of retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable unique id; the join key across all indexes
    pub chunk_id: String,
    pub text: String,
    pub doc_id: String,
    pub doc_type: DocType,
    #[serde(default)]
    pub section_title: String,
    pub section_kind: SectionKind,
    /// Publication year
    pub year: i32,
    pub authority_tier: AuthorityTier,
    pub evidence_level: EvidenceLevel,
    pub domain: Domain,
    #[serde(default)]
    pub cpt_codes: BTreeSet<String>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub tags: ChunkTags,
}

/// Immutable in-memory chunk store keyed by chunk_id
pub struct ChunkStore {
    chunks: HashMap<String, Arc<Chunk>>,
    /// Insertion order, for deterministic iteration
    order: Vec<String>,
    /// Lowercased token -> number of distinct chunks mentioning it.
    /// Backs the fuzzy-correction gate in the query normalizer.
    mention_counts: HashMap<String, u32>,
}

impl ChunkStore {
    /// Build a store from already-parsed chunks, enforcing corpus invariants
    pub fn from_chunks(chunks: Vec<Chunk>) -> Result<Self> {
        let normalizer = TextNormalizer::new();
        let mut store = Self {
            chunks: HashMap::with_capacity(chunks.len()),
            order: Vec::with_capacity(chunks.len()),
            mention_counts: HashMap::new(),
        };

        for mut chunk in chunks {
            if store.chunks.contains_key(&chunk.chunk_id) {
                return Err(IpError::Corpus(format!(
                    "Duplicate chunk_id: {}",
                    chunk.chunk_id
                )));
            }

            chunk.text = normalizer.normalize(&chunk.text);

            // Invariant: every indexed CPT code appears in the chunk text.
            // Violations lose the code, not the chunk.
            let missing: Vec<String> = chunk
                .cpt_codes
                .iter()
                .filter(|c| !chunk.text.contains(c.as_str()))
                .cloned()
                .collect();
            for code in missing {
                tracing::warn!(
                    "Chunk {} lists CPT {} that never appears in its text; dropping from index",
                    chunk.chunk_id,
                    code
                );
                chunk.cpt_codes.remove(&code);
            }

            let mut seen: HashSet<String> = HashSet::new();
            for token in tokenize(&chunk.text) {
                if seen.insert(token.clone()) {
                    *store.mention_counts.entry(token).or_insert(0) += 1;
                }
            }

            store.order.push(chunk.chunk_id.clone());
            store.chunks.insert(chunk.chunk_id.clone(), Arc::new(chunk));
        }

        tracing::info!("Chunk store loaded: {} chunks", store.chunks.len());
        Ok(store)
    }

    /// Load a newline-delimited JSON chunk stream
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| IpError::Io {
            source: e,
            context: format!("Failed to open chunk stream: {:?}", path),
        })?;

        let mut chunks = Vec::new();
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| IpError::Io {
                source: e,
                context: format!("Failed to read chunk stream line {}", lineno + 1),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: Chunk = serde_json::from_str(&line).map_err(|e| IpError::Json {
                source: e,
                context: format!("Malformed chunk record at line {}", lineno + 1),
            })?;
            chunks.push(chunk);
        }

        Self::from_chunks(chunks)
    }

    pub fn get(&self, chunk_id: &str) -> Option<Arc<Chunk>> {
        self.chunks.get(chunk_id).cloned()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Iterate chunks in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.order.iter().filter_map(|id| self.chunks.get(id))
    }

    /// Number of distinct chunks whose text mentions `term` (lowercased)
    pub fn chunks_mentioning(&self, term: &str) -> usize {
        self.mention_counts
            .get(&term.to_lowercase())
            .copied()
            .unwrap_or(0) as usize
    }
}

/// Whitespace + lowercase tokenization with punctuation stripped from edges
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A minimal chunk for unit tests; callers override fields as needed
    pub fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            text: text.to_string(),
            doc_id: format!("doc-{}", id),
            doc_type: DocType::BookChapter,
            section_title: String::new(),
            section_kind: SectionKind::Procedure,
            year: 2024,
            authority_tier: AuthorityTier::A1,
            evidence_level: EvidenceLevel::H3,
            domain: Domain::Clinical,
            cpt_codes: BTreeSet::new(),
            aliases: BTreeSet::new(),
            tags: ChunkTags::default(),
        }
    }
}
