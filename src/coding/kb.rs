//! Coding knowledge base loader
//!
//! The KB is a JSON file with code descriptions, add-on families, NCCI edit
//! pairs, bilateral eligibility, and the ICD-10-PCS crosswalk. Two files may
//! coexist; the first existing path is authoritative and later files only
//! fill sections the primary leaves empty. The crate ships an embedded
//! default so the coder works without any files on disk.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::coding::Site;

/// Embedded default KB
const BUILTIN_KB: &str = include_str!("../../data/ip_coding_billing.json");

#[derive(Error, Debug)]
pub enum KbError {
    #[error("KB file unreadable: {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("KB malformed: {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KbMetadata {
    #[serde(default)]
    version: Option<String>,
}

/// One NCCI edit: `code` bundles into `bundles_into` and must not be billed
/// alongside it
#[derive(Debug, Clone, Deserialize)]
pub struct NcciEdit {
    pub code: String,
    pub bundles_into: String,
    #[serde(default)]
    pub reason: String,
}

/// ICD-10-PCS crosswalk entry: a single code or one per site
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PcsEntry {
    Single(String),
    BySite(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KbData {
    #[serde(default)]
    metadata: KbMetadata,
    #[serde(default)]
    cpt_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    addon_families: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    ncci_bundles: Vec<NcciEdit>,
    #[serde(default)]
    bilateral_eligible: BTreeSet<String>,
    #[serde(default)]
    surgical_bronchoscopy: BTreeSet<String>,
    #[serde(default)]
    icd10_pcs_crosswalk: BTreeMap<String, PcsEntry>,
    #[serde(default)]
    hcpcs_devices: BTreeMap<String, Vec<String>>,
}

impl KbData {
    /// Fill sections the primary left empty from a fallback file. The
    /// primary always wins on conflict.
    fn merge_missing(&mut self, fallback: KbData) {
        for (code, desc) in fallback.cpt_descriptions {
            self.cpt_descriptions.entry(code).or_insert(desc);
        }
        for (primary, addons) in fallback.addon_families {
            self.addon_families.entry(primary).or_insert(addons);
        }
        if self.ncci_bundles.is_empty() {
            self.ncci_bundles = fallback.ncci_bundles;
        }
        if self.bilateral_eligible.is_empty() {
            self.bilateral_eligible = fallback.bilateral_eligible;
        }
        if self.surgical_bronchoscopy.is_empty() {
            self.surgical_bronchoscopy = fallback.surgical_bronchoscopy;
        }
        for (id, entry) in fallback.icd10_pcs_crosswalk {
            self.icd10_pcs_crosswalk.entry(id).or_insert(entry);
        }
        for (id, codes) in fallback.hcpcs_devices {
            self.hcpcs_devices.entry(id).or_insert(codes);
        }
    }
}

/// Loaded, immutable coding KB
pub struct CodingKb {
    data: KbData,
    version: String,
}

impl CodingKb {
    /// Load the KB from the first existing path; later paths fill gaps.
    /// Falls back to the embedded default when no file exists.
    pub fn load(paths: &[PathBuf]) -> Result<Self, KbError> {
        let existing: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();

        let Some(primary_path) = existing.first() else {
            tracing::info!("No KB file found; using embedded default");
            return Ok(Self::builtin());
        };

        let mut data = Self::parse_file(primary_path)?;
        for fallback_path in &existing[1..] {
            match Self::parse_file(fallback_path) {
                Ok(fallback) => data.merge_missing(fallback),
                Err(e) => tracing::warn!("Skipping fallback KB: {}", e),
            }
        }

        let version = match &data.metadata.version {
            Some(v) => v.clone(),
            None => file_mtime_version(primary_path),
        };

        tracing::info!(
            "Coding KB loaded from {:?} (version {})",
            primary_path,
            version
        );
        Ok(Self { data, version })
    }

    /// The embedded default KB
    pub fn builtin() -> Self {
        let data: KbData =
            serde_json::from_str(BUILTIN_KB).expect("embedded KB must parse");
        let version = data
            .metadata
            .version
            .clone()
            .map(|v| format!("builtin:{}", v))
            .unwrap_or_else(|| "builtin".to_string());
        Self { data, version }
    }

    fn parse_file(path: &Path) -> Result<KbData, KbError> {
        let content = std::fs::read_to_string(path).map_err(|e| KbError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| KbError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// KB version string: explicit `metadata.version` or the file mtime
    pub fn version_info(&self) -> &str {
        &self.version
    }

    pub fn describe(&self, code: &str) -> Option<&str> {
        self.data.cpt_descriptions.get(code).map(String::as_str)
    }

    pub fn knows(&self, code: &str) -> bool {
        self.data.cpt_descriptions.contains_key(code)
    }

    pub fn addons_for(&self, primary: &str) -> &[String] {
        self.data
            .addon_families
            .get(primary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn ncci_edits(&self) -> &[NcciEdit] {
        &self.data.ncci_bundles
    }

    pub fn is_bilateral_eligible(&self, code: &str) -> bool {
        self.data.bilateral_eligible.contains(code)
    }

    /// Codes whose presence bundles away diagnostic bronchoscopy (31622)
    pub fn is_surgical_bronchoscopy(&self, code: &str) -> bool {
        self.data.surgical_bronchoscopy.contains(code)
    }

    /// ICD-10-PCS code for a performed item, site-aware where the crosswalk
    /// distinguishes sites
    pub fn pcs_for(&self, item_id: &str, site: Site) -> Option<&str> {
        match self.data.icd10_pcs_crosswalk.get(item_id)? {
            PcsEntry::Single(code) => Some(code.as_str()),
            PcsEntry::BySite(by_site) => {
                let key = match site {
                    Site::Trachea => "trachea",
                    Site::Bronchus => "bronchus",
                    Site::Lobe => "lobe",
                    Site::Unknown => "default",
                };
                by_site
                    .get(key)
                    .or_else(|| by_site.get("default"))
                    .map(String::as_str)
            }
        }
    }

    pub fn hcpcs_for(&self, item_id: &str) -> &[String] {
        self.data
            .hcpcs_devices
            .get(item_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn file_mtime_version(path: &Path) -> String {
    let mtime = path
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .map(|t| {
            let dt: chrono::DateTime<chrono::Utc> = t.into();
            dt.format("%Y-%m-%dT%H:%M:%S").to_string()
        })
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "file:{} mtime:{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        mtime
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kb_parses() {
        let kb = CodingKb::builtin();
        assert!(kb.version_info().starts_with("builtin"));
        assert!(kb.describe("31653").is_some());
        assert!(kb.is_surgical_bronchoscopy("31640"));
        assert!(!kb.is_surgical_bronchoscopy("31622"));
    }

    #[test]
    fn test_missing_files_fall_back_to_builtin() {
        let kb = CodingKb::load(&[PathBuf::from("/nonexistent/kb.json")]).unwrap();
        assert!(kb.describe("31628").is_some());
    }

    #[test]
    fn test_primary_wins_fallback_fills() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("ip_coding_billing.json");
        let fallback = dir.path().join("coding_module.json");

        std::fs::write(
            &primary,
            r#"{
                "metadata": {"version": "9.9"},
                "cpt_descriptions": {"31622": "primary description"}
            }"#,
        )
        .unwrap();
        std::fs::write(
            &fallback,
            r#"{
                "cpt_descriptions": {
                    "31622": "fallback description",
                    "31628": "fallback only"
                },
                "bilateral_eligible": ["32554"]
            }"#,
        )
        .unwrap();

        let kb = CodingKb::load(&[primary, fallback]).unwrap();
        assert_eq!(kb.version_info(), "9.9");
        assert_eq!(kb.describe("31622"), Some("primary description"));
        assert_eq!(kb.describe("31628"), Some("fallback only"));
        assert!(kb.is_bilateral_eligible("32554"));
    }

    #[test]
    fn test_mtime_version_when_unversioned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, r#"{"cpt_descriptions": {"31622": "x"}}"#).unwrap();

        let kb = CodingKb::load(&[path]).unwrap();
        assert!(kb.version_info().starts_with("file:kb.json mtime:"));
    }

    #[test]
    fn test_site_aware_pcs() {
        let kb = CodingKb::builtin();
        let tracheal = kb.pcs_for("tumor_excision_bronchoscopic", Site::Trachea);
        let bronchial = kb.pcs_for("tumor_excision_bronchoscopic", Site::Bronchus);
        assert!(tracheal.is_some());
        assert!(bronchial.is_some());
        assert_ne!(tracheal, bronchial);
    }
}
