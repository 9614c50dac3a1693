//! Query normalization: typo repair and abbreviation expansion
//!
//! Runs before retrieval so every retriever sees the same canonical text.
//! Abbreviations expand to `abbr (long form)`; typos are repaired by bounded
//! edit distance against a medical lexicon, gated on the corpus actually
//! containing the candidate term. Normalization is idempotent.

use crate::corpus::ChunkStore;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Minimum number of corpus chunks that must mention a lexicon term before a
/// fuzzy correction to it is trusted
const FUZZY_MENTION_GATE: usize = 3;

/// Maximum edit distance for a fuzzy correction
const FUZZY_MAX_DISTANCE: usize = 2;

/// Tokens shorter than this are never fuzzed (too many false positives)
const FUZZY_MIN_TOKEN_LEN: usize = 4;

/// Normalized query plus the abbreviation expansions that were applied
#[derive(Debug, Clone)]
pub struct NormalizedQuery {
    pub raw: String,
    pub text: String,
    pub expansions: BTreeMap<String, String>,
}

/// Query normalizer with a curated abbreviation dictionary and medical lexicon
pub struct QueryNormalizer {
    abbreviations: HashMap<String, String>,
    lexicon: HashSet<String>,
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryNormalizer {
    pub fn new() -> Self {
        let abbreviations = builtin_abbreviations();
        let mut lexicon: HashSet<String> = builtin_lexicon();

        // Long-form words are canonical by definition; never fuzz them away
        for long_form in abbreviations.values() {
            for word in long_form.split_whitespace() {
                lexicon.insert(word.to_string());
            }
        }

        Self {
            abbreviations,
            lexicon,
        }
    }

    /// Normalize a raw user query against the loaded corpus
    pub fn normalize(&self, raw: &str, store: &ChunkStore) -> NormalizedQuery {
        let lowered = raw.to_lowercase();
        let stripped = strip_punctuation(&lowered);

        let (expanded, expansions) = self.expand_abbreviations(&stripped);
        let corrected = self.fuzzy_fix(&expanded, store);

        if corrected != lowered {
            tracing::debug!("Query normalized: {:?} -> {:?}", raw, corrected);
        }

        NormalizedQuery {
            raw: raw.to_string(),
            text: corrected,
            expansions,
        }
    }

    fn expand_abbreviations(&self, text: &str) -> (String, BTreeMap<String, String>) {
        let mut expansions = BTreeMap::new();
        let mut out: Vec<String> = Vec::new();

        for token in text.split_whitespace() {
            if let Some(long_form) = self.abbreviations.get(token) {
                // Idempotence: skip when the expansion is already present
                if !text.contains(long_form.as_str()) {
                    out.push(format!("{} ({})", token, long_form));
                    expansions.insert(token.to_string(), long_form.clone());
                    continue;
                }
            }
            out.push(token.to_string());
        }

        (out.join(" "), expansions)
    }

    fn fuzzy_fix(&self, text: &str, store: &ChunkStore) -> String {
        let fixed: Vec<String> = text
            .split_whitespace()
            .map(|token| {
                let bare = token.trim_matches(|c| c == '(' || c == ')');
                if bare.len() < FUZZY_MIN_TOKEN_LEN
                    || bare.chars().all(|c| c.is_ascii_digit())
                    || self.lexicon.contains(bare)
                    || self.abbreviations.contains_key(bare)
                {
                    return token.to_string();
                }

                match self.best_correction(bare, store) {
                    Some(correction) => token.replacen(bare, &correction, 1),
                    None => token.to_string(),
                }
            })
            .collect();

        fixed.join(" ")
    }

    /// Closest lexicon term within the distance bound, preferring the term
    /// with more corpus support on ties. Returns None when no candidate has
    /// enough corpus mentions.
    fn best_correction(&self, token: &str, store: &ChunkStore) -> Option<String> {
        let mut best: Option<(usize, usize, &str)> = None;

        for term in &self.lexicon {
            if term.len().abs_diff(token.len()) > FUZZY_MAX_DISTANCE {
                continue;
            }
            let dist = levenshtein_with_max(token, term, FUZZY_MAX_DISTANCE);
            if dist > FUZZY_MAX_DISTANCE {
                continue;
            }
            let mentions = store.chunks_mentioning(term);
            if mentions < FUZZY_MENTION_GATE {
                continue;
            }
            let candidate = (dist, usize::MAX - mentions, term.as_str());
            if best.map_or(true, |b| candidate < (b.0, b.1, b.2)) {
                best = Some(candidate);
            }
        }

        best.map(|(_, _, term)| term.to_string())
    }
}

/// Strip sentence punctuation. Five-digit CPT tokens survive because the
/// stripped characters never occur inside a digit run.
fn strip_punctuation(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| match c {
            '.' | ',' | ';' | ':' | '?' | '!' | '"' | '\'' => ' ',
            _ => c,
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bounded Levenshtein distance; returns `max + 1` once the bound is exceeded
fn levenshtein_with_max(a: &str, b: &str, max: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > max {
        return max + 1;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > max {
            return max + 1;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn builtin_abbreviations() -> HashMap<String, String> {
    [
        ("tef", "tracheoesophageal fistula"),
        ("ebus", "endobronchial ultrasound"),
        ("tbna", "transbronchial needle aspiration"),
        ("tblb", "transbronchial lung biopsy"),
        ("blvr", "bronchoscopic lung volume reduction"),
        ("sems", "self-expanding metal stent"),
        ("enb", "electromagnetic navigation bronchoscopy"),
        ("apc", "argon plasma coagulation"),
        ("pdt", "percutaneous dilational tracheostomy"),
        ("wll", "whole lung lavage"),
        ("ipc", "indwelling pleural catheter"),
        ("copd", "chronic obstructive pulmonary disease"),
        ("mwa", "microwave ablation"),
        ("rfa", "radiofrequency ablation"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn builtin_lexicon() -> HashSet<String> {
    [
        "tracheoesophageal",
        "fistula",
        "benign",
        "malignant",
        "stent",
        "stenosis",
        "stricture",
        "bronchoscopy",
        "endobronchial",
        "ultrasound",
        "transbronchial",
        "aspiration",
        "biopsy",
        "ablation",
        "microwave",
        "radiofrequency",
        "cryotherapy",
        "photodynamic",
        "argon",
        "plasma",
        "coagulation",
        "electromagnetic",
        "navigation",
        "fiducial",
        "marker",
        "markers",
        "hemoptysis",
        "pneumothorax",
        "emphysema",
        "bronchiectasis",
        "obstruction",
        "tumor",
        "carcinoma",
        "lymph",
        "node",
        "mediastinal",
        "hilar",
        "peripheral",
        "airway",
        "trachea",
        "tracheal",
        "bronchus",
        "bronchial",
        "esophagus",
        "pleura",
        "pleural",
        "effusion",
        "empyema",
        "thoracentesis",
        "pleurodesis",
        "thoracoscopy",
        "drainage",
        "valve",
        "valves",
        "lavage",
        "dilation",
        "contraindication",
        "contraindications",
        "complication",
        "complications",
        "sedation",
        "anesthesia",
        "fluoroscopy",
        "placement",
        "management",
        "training",
        "competency",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
