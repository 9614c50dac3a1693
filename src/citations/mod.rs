//! Citation resolution and the reference visibility policy
//!
//! Maps chunk ids cited in a draft to formatted references via a pre-built
//! `doc_id -> citation` index. Textbook chapters may ground an answer but
//! stay out of the visible reference list; references are numbered in order
//! of first appearance and deduplicated by doc_id.

use crate::config::CitationConfig;
use crate::corpus::DocType;
use crate::error::{IpError, Result};
use crate::retrieval::{PrecedenceModel, RetrievedHit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One record of the ingestion citation index, keyed by doc_id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationRecord {
    #[serde(default)]
    pub authors: Vec<String>,
    pub year: i32,
    pub title: String,
    #[serde(default)]
    pub venue: String,
    pub doc_type: DocType,
}

/// A resolved citation attached to a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub doc_id: String,
    pub authors: Vec<String>,
    pub year: i32,
    pub title: String,
    pub venue: String,
    pub visible: bool,
}

impl Citation {
    /// "Author A, Author B, et al. (year). Title. Venue."
    pub fn formatted(&self) -> String {
        let authors = match self.authors.len() {
            0 => String::new(),
            1 => format!("{}. ", self.authors[0]),
            2 => format!("{}, {}. ", self.authors[0], self.authors[1]),
            _ => format!("{}, {}, et al. ", self.authors[0], self.authors[1]),
        };
        let venue = if self.venue.is_empty() {
            String::new()
        } else {
            format!(" {}.", self.venue)
        };
        format!("{}({}). {}.{}", authors, self.year, self.title, venue)
    }
}

/// Pre-built doc_id -> citation lookup
pub struct CitationIndex {
    records: HashMap<String, CitationRecord>,
}

impl CitationIndex {
    pub fn from_records(records: HashMap<String, CitationRecord>) -> Self {
        Self { records }
    }

    /// Load the ingestion-provided JSON object keyed by doc_id
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IpError::Io {
            source: e,
            context: format!("Failed to read citation index: {:?}", path),
        })?;
        let records: HashMap<String, CitationRecord> =
            serde_json::from_str(&content).map_err(|e| IpError::Json {
                source: e,
                context: "Malformed citation index".to_string(),
            })?;

        tracing::info!("Citation index loaded: {} documents", records.len());
        Ok(Self { records })
    }

    pub fn get(&self, doc_id: &str) -> Option<&CitationRecord> {
        self.records.get(doc_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Resolver applying the visibility policy
pub struct CitationResolver {
    index: CitationIndex,
    visible_doctypes: HashSet<String>,
    inline_marker: Regex,
}

impl CitationResolver {
    pub fn new(index: CitationIndex, config: &CitationConfig) -> Self {
        Self {
            index,
            visible_doctypes: config.visible_doctypes.iter().cloned().collect(),
            inline_marker: Regex::new(r"\[([A-Za-z0-9_:\-\.]+)\]").expect("static regex"),
        }
    }

    /// Chunk ids referenced inline in the draft (as `[chunk_id]` markers),
    /// in order of first appearance. Falls back to grounding order when the
    /// draft carries no markers.
    pub fn cited_chunk_ids(&self, draft: &str, grounding: &[RetrievedHit]) -> Vec<String> {
        let known: HashSet<&str> = grounding.iter().map(|h| h.chunk_id()).collect();
        let mut seen = HashSet::new();
        let mut ids: Vec<String> = self
            .inline_marker
            .captures_iter(draft)
            .filter_map(|caps| {
                let id = caps.get(1)?.as_str();
                if known.contains(id) && seen.insert(id.to_string()) {
                    Some(id.to_string())
                } else {
                    None
                }
            })
            .collect();

        if ids.is_empty() {
            ids = grounding.iter().map(|h| h.chunk_id().to_string()).collect();
        }
        ids
    }

    /// Resolve cited chunks to citation records, deduplicated by doc_id and
    /// ordered by first appearance
    pub fn resolve(&self, cited: &[String], grounding: &[RetrievedHit]) -> Vec<Citation> {
        let by_chunk: HashMap<&str, &RetrievedHit> =
            grounding.iter().map(|h| (h.chunk_id(), h)).collect();

        let mut seen_docs = HashSet::new();
        let mut citations = Vec::new();

        for chunk_id in cited {
            let Some(hit) = by_chunk.get(chunk_id.as_str()) else {
                continue;
            };
            let doc_id = &hit.chunk.doc_id;
            if !seen_docs.insert(doc_id.clone()) {
                continue;
            }

            let citation = match self.index.get(doc_id) {
                Some(record) => Citation {
                    chunk_id: chunk_id.clone(),
                    doc_id: doc_id.clone(),
                    authors: record.authors.clone(),
                    year: record.year,
                    title: record.title.clone(),
                    venue: record.venue.clone(),
                    visible: self.is_visible(record.doc_type),
                },
                // No index record: fall back to chunk metadata
                None => Citation {
                    chunk_id: chunk_id.clone(),
                    doc_id: doc_id.clone(),
                    authors: Vec::new(),
                    year: hit.chunk.year,
                    title: hit.chunk.section_title.clone(),
                    venue: String::new(),
                    visible: self.is_visible(hit.chunk.doc_type),
                },
            };
            citations.push(citation);
        }

        citations
    }

    fn is_visible(&self, doc_type: DocType) -> bool {
        self.visible_doctypes.contains(doc_type.as_str())
    }

    /// Render the visible reference list, numbered by first appearance
    pub fn format_references(citations: &[Citation]) -> String {
        citations
            .iter()
            .filter(|c| c.visible)
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c.formatted()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Warnings for stale coding content among the grounding set. Surfaced
    /// here so every response that cites coding material carries the flag.
    pub fn stale_coding_warnings(
        grounding: &[RetrievedHit],
        precedence: &PrecedenceModel,
    ) -> Vec<String> {
        grounding
            .iter()
            .filter(|hit| precedence.is_stale_coding(&hit.chunk))
            .map(|hit| {
                format!(
                    "stale_coding: {} ({}) predates the coding half-life; verify against current code sets",
                    hit.chunk.doc_id, hit.chunk.year
                )
            })
            .collect()
    }
}
