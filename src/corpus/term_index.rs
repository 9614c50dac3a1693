//! Static exact-match term index: CPT codes and device/procedure aliases
//!
//! Built once from the chunk corpus (or loaded from the ingestion payload)
//! and read-only at query time.

use crate::corpus::ChunkStore;
use crate::error::{IpError, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::Path;

/// Exact-match lookup tables
pub struct TermIndex {
    cpt: HashMap<String, BTreeSet<String>>,
    alias: HashMap<String, BTreeSet<String>>,
}

/// One record of the ingestion term-index payload. Each line carries either
/// a `cpt_code` or an `alias` together with the chunk ids that mention it.
#[derive(Debug, Deserialize)]
struct TermRecord {
    #[serde(default)]
    cpt_code: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    chunks: Vec<String>,
}

impl TermIndex {
    /// Derive the index from the chunk store
    pub fn build(store: &ChunkStore) -> Self {
        let mut cpt: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut alias: HashMap<String, BTreeSet<String>> = HashMap::new();

        for chunk in store.iter() {
            for code in &chunk.cpt_codes {
                cpt.entry(code.clone())
                    .or_default()
                    .insert(chunk.chunk_id.clone());
            }
            for a in &chunk.aliases {
                alias
                    .entry(a.to_lowercase())
                    .or_default()
                    .insert(chunk.chunk_id.clone());
            }
        }

        tracing::info!(
            "Term index built: {} CPT codes, {} aliases",
            cpt.len(),
            alias.len()
        );
        Self { cpt, alias }
    }

    /// Load the ingestion-provided JSONL payload
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| IpError::Io {
            source: e,
            context: format!("Failed to open term index payload: {:?}", path),
        })?;

        let mut cpt: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut alias: HashMap<String, BTreeSet<String>> = HashMap::new();

        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| IpError::Io {
                source: e,
                context: format!("Failed to read term index line {}", lineno + 1),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TermRecord = serde_json::from_str(&line).map_err(|e| IpError::Json {
                source: e,
                context: format!("Malformed term record at line {}", lineno + 1),
            })?;

            if let Some(code) = record.cpt_code {
                cpt.entry(code).or_default().extend(record.chunks);
            } else if let Some(a) = record.alias {
                alias
                    .entry(a.to_lowercase())
                    .or_default()
                    .extend(record.chunks);
            }
        }

        Ok(Self { cpt, alias })
    }

    /// Chunk ids carrying an exact CPT code
    pub fn by_cpt(&self, code: &str) -> Option<&BTreeSet<String>> {
        self.cpt.get(code)
    }

    /// Chunk ids carrying a canonical alias (lowercased lookup)
    pub fn by_alias(&self, alias: &str) -> Option<&BTreeSet<String>> {
        self.alias.get(&alias.to_lowercase())
    }

    /// All known aliases, for substring scanning of queries
    pub fn aliases(&self) -> impl Iterator<Item = &String> {
        self.alias.keys()
    }

    pub fn cpt_count(&self) -> usize {
        self.cpt.len()
    }

    pub fn alias_count(&self) -> usize {
        self.alias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_fixtures::chunk;

    #[test]
    fn test_build_from_store() {
        let mut c1 = chunk("c1", "EBUS-TBNA is reported with 31652");
        c1.cpt_codes.insert("31652".to_string());
        c1.aliases.insert("EBUS-TBNA".to_string());

        let mut c2 = chunk("c2", "multi-station sampling uses 31653");
        c2.cpt_codes.insert("31653".to_string());
        c2.aliases.insert("ebus-tbna".to_string());

        let store = ChunkStore::from_chunks(vec![c1, c2]).unwrap();
        let index = TermIndex::build(&store);

        assert_eq!(index.cpt_count(), 2);
        assert_eq!(index.alias_count(), 1);
        assert!(index.by_cpt("31652").unwrap().contains("c1"));
        // Alias lookup is case-insensitive and merged across chunks
        let hits = index.by_alias("EBUS-TBNA").unwrap();
        assert!(hits.contains("c1") && hits.contains("c2"));
    }

    #[test]
    fn test_load_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terms.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"cpt_code\":\"31622\",\"chunks\":[\"c9\"]}\n",
                "{\"alias\":\"Fiducial Marker\",\"chunks\":[\"c3\",\"c4\"]}\n",
            ),
        )
        .unwrap();

        let index = TermIndex::load_jsonl(&path).unwrap();
        assert!(index.by_cpt("31622").unwrap().contains("c9"));
        assert_eq!(index.by_alias("fiducial marker").unwrap().len(), 2);
    }
}
