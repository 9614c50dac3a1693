//! Compiled regex battery for operative-note extraction
//!
//! Patterns are compiled once into a registry and shared process-wide. Named
//! capture groups pull out station labels; the negative-mention guard drops
//! matches that sit inside a window of declination language.

use regex::Regex;
use std::collections::BTreeSet;

/// Tokens within this distance of a match are checked for negation
const NEGATION_WINDOW: usize = 8;

/// Words that mark a mentioned-but-not-performed procedure
const NEGATION_TERMS: &[&str] = &["no", "declined", "considered", "deferred", "reluctant"];

/// Laterality read from a note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Laterality {
    Left,
    Right,
    Bilateral,
    Unspecified,
}

/// Pre-compiled note patterns
pub struct NotePatterns {
    pub stent_generic: Regex,
    pub stent_brand: Regex,
    pub y_stent: Regex,
    pub tracheal_terms: Regex,
    pub bronchial_terms: Regex,
    pub dilation: Regex,
    pub excision: Regex,
    pub specimen: Regex,
    pub destruction: Regex,
    pub whole_lung_lavage: Regex,
    pub ebus: Regex,
    pub radial_ebus: Regex,
    pub tbna: Regex,
    pub tblb: Regex,
    pub station_list: Regex,
    pub station_token: Regex,
    pub station_bare: Regex,
    pub lobes: Regex,
    pub bilateral: Regex,
    pub right: Regex,
    pub left: Regex,
    pub moderate_sedation: Regex,
    pub sedation_minutes: Regex,
    pub hhmm_times: Regex,
    pub general_anesthesia: Regex,
    pub separate_provider: Regex,
    pub cpt_token: Regex,
    pub stent_size: Regex,
    pub multiple_bronchial_stents: Regex,
}

impl Default for NotePatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl NotePatterns {
    pub fn new() -> Self {
        let rx = |pattern: &str| Regex::new(pattern).expect("static note pattern");

        Self {
            stent_generic: rx(r"(?i)\b(stent|sems|metallic\s+stent|silicone\s+stent|airway\s+stent)\w*\b"),
            stent_brand: rx(
                r"(?xi)\b(
                    bona[\s-]?stent|
                    aero(?:mini)?|
                    ultra[\s-]?flex|
                    dumon(?:\s*y)?|
                    poly[\s-]?flex|
                    hood|
                    niti[\s-]?s|
                    taewoong
                )\b",
            ),
            y_stent: rx(r"(?i)\b(y[\s-]?stent|carinal\s+y[\s-]?stent|dynamic\s*y)\b"),
            tracheal_terms: rx(r"(?i)\b(trachea|tracheal|subglotti\w*|cricoid|carina|carinal)\b"),
            bronchial_terms: rx(
                r"(?i)\b(bronchus|bronchial|mainstem|main\s+stem|lobar\s+bronchus|segmental\s+bronchus)\b",
            ),
            dilation: rx(r"(?i)\b(balloon\s+dilat\w*|pneumatic\s+dilat\w*|rigid\s+dilat\w*|dilat\w*)\b"),
            excision: rx(
                r"(?i)\b(electrocautery\s+snare|snare|polypectomy|transect\w*|resect\w*|excis\w*|completely\s+removed)\b",
            ),
            specimen: rx(r"(?i)\bspecimens?\s+(sent|collected|submitted)\b"),
            destruction: rx(
                r"(?i)\b(apc|argon\s+plasma|laser(?:\s+(?:ablation|therapy|destruction))?|cryo\s*destruction|cryoablation|thermal\s+destruct\w*)\b",
            ),
            whole_lung_lavage: rx(
                r"(?i)\b(whole\s+lung\s+lavage|wll|double[\s-]lumen\s+lavage|bilateral\s+lung\s+lavage)\b",
            ),
            ebus: rx(r"(?i)\b(ebus|endobronchial\s+ultrasound)\b"),
            radial_ebus: rx(r"(?i)\b(radial\s+(?:probe\s+)?ebus|r-ebus|radial\s+probe|miniprobe)\b"),
            tbna: rx(r"(?i)\b(tbna|transbronchial\s+needle\s+aspiration|needle\s+aspiration)\b"),
            tblb: rx(
                r"(?i)\b(tblb|transbronchial\s+lung\s+biops\w*|transbronchial\s+biops\w*|forceps\s+biops\w*|cryobiops\w*)\b",
            ),
            // "stations 4R, 7, and 11L" - keyword followed by a station list
            station_list: rx(
                r"(?i)\b(?:stations?|levels?|nodes?)\b[:#\s]*((?:(?:1[0-4]|[1-9])[RLrl]?[,;\s]*(?:and\s+)?)+)",
            ),
            station_token: rx(r"\b(?P<num>1[0-4]|[1-9])(?P<lat>[RLrl])?\b"),
            // Bare station mention requires an explicit laterality letter
            station_bare: rx(r"\b(?P<num2>1[0-4]|[1-9])(?P<lat2>[RL])\b"),
            lobes: rx(
                r"(?i)\b(rul|rml|rll|lul|lll|lingula|right\s+upper|right\s+middle|right\s+lower|left\s+upper|left\s+lower)\b",
            ),
            bilateral: rx(r"(?i)\b(bilateral|bilaterally|both\s+sides?|both\s+lungs?)\b"),
            right: rx(r"(?i)\b(right|rt\.?)\s*(sided?|lung|side|chest|pleural|hilar|paratracheal)\b"),
            left: rx(r"(?i)\b(left|lt\.?)\s*(sided?|lung|side|chest|pleural|hilar|subaortic)\b"),
            moderate_sedation: rx(
                r"(?i)\b(moderate\s+sedation|conscious\s+sedation|versed|fentanyl|midazolam|propofol)\b",
            ),
            sedation_minutes: rx(
                r"(?i)sedat\w*[\s,:]+(?:time|duration)?[\s:]*(?:for\s+)?(?P<mins>\d+)\s*min|(?P<mins2>\d+)\s*min\w*\s+(?:of\s+)?sedat",
            ),
            hhmm_times: rx(r"(\d{1,2}:\d{2})\s*(?:to|through|-|\u{2013})\s*(\d{1,2}:\d{2})"),
            general_anesthesia: rx(
                r"(?i)\b(general\s+an?esthesia|ga|lma|laryngeal\s+mask|endotracheal|ett|intubat\w*|muscle\s+relax\w*|paralytic|rocuronium|succinylcholine|vecuronium)\b",
            ),
            separate_provider: rx(r"(?i)\b(anesthesiolog\w*|crna)\b"),
            cpt_token: rx(r"\b\d{5}\b"),
            stent_size: rx(r"(?i)\b\d{1,2}\s*(?:x\s*\d{1,2}\s*)?mm\b"),
            multiple_bronchial_stents: rx(
                r"(?i)\b(both\s+mainstem|bilateral\s+stent\w*|two\s+stents?|multiple\s+stents?)\b",
            ),
        }
    }

    /// True when the matched span sits inside a declination window
    /// ("stent was considered but declined", "no stent placed")
    pub fn is_negated(&self, text: &str, match_start: usize, _match_end: usize) -> bool {
        let tokens: Vec<(usize, &str)> = text
            .split_whitespace()
            .scan(0usize, |offset, token| {
                let start = text[*offset..].find(token).map(|i| i + *offset)?;
                *offset = start + token.len();
                Some((start, token))
            })
            .collect();

        let match_index = tokens
            .iter()
            .position(|(start, token)| *start <= match_start && match_start < start + token.len());

        let Some(match_index) = match_index else {
            return false;
        };

        let lo = match_index.saturating_sub(NEGATION_WINDOW);
        let hi = (match_index + NEGATION_WINDOW + 1).min(tokens.len());
        let window: Vec<String> = tokens[lo..hi]
            .iter()
            .map(|(_, t)| {
                t.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .collect();

        if window
            .iter()
            .any(|t| NEGATION_TERMS.contains(&t.as_str()))
        {
            return true;
        }

        // "not placed" as a bigram, anywhere in the window
        window
            .windows(2)
            .any(|pair| pair[0] == "not" && pair[1].starts_with("placed"))
    }

    /// Unique lymph node stations mentioned in the note, normalized
    /// ("4R", "7", "11L")
    pub fn extract_stations(&self, text: &str) -> BTreeSet<String> {
        let mut stations = BTreeSet::new();

        for caps in self.station_list.captures_iter(text) {
            if let Some(list) = caps.get(1) {
                for token in self.station_token.captures_iter(list.as_str()) {
                    if let Some(station) = normalize_station(
                        token.name("num").map(|m| m.as_str()),
                        token.name("lat").map(|m| m.as_str()),
                    ) {
                        stations.insert(station);
                    }
                }
            }
        }

        for caps in self.station_bare.captures_iter(text) {
            if let Some(station) = normalize_station(
                caps.name("num2").map(|m| m.as_str()),
                caps.name("lat2").map(|m| m.as_str()),
            ) {
                stations.insert(station);
            }
        }

        stations
    }

    /// Unique lobes mentioned in the note, mapped to canonical labels
    pub fn extract_lobes(&self, text: &str) -> BTreeSet<String> {
        self.lobes
            .find_iter(text)
            .filter_map(|m| map_lobe(m.as_str()))
            .collect()
    }

    /// Laterality from explicit words, lateralized station labels, and lobes
    pub fn laterality(&self, text: &str) -> Laterality {
        if self.bilateral.is_match(text) {
            return Laterality::Bilateral;
        }

        let stations = self.extract_stations(text);
        let lobes = self.extract_lobes(text);
        let has_right = self.right.is_match(text)
            || stations.iter().any(|s| s.ends_with('R'))
            || lobes.iter().any(|l| l.starts_with('R'));
        let has_left = self.left.is_match(text)
            || stations.iter().any(|s| s.ends_with('L'))
            || lobes.iter().any(|l| l.starts_with('L'));

        match (has_right, has_left) {
            (true, true) => Laterality::Bilateral,
            (true, false) => Laterality::Right,
            (false, true) => Laterality::Left,
            (false, false) => Laterality::Unspecified,
        }
    }
}

/// Stations 2/4/10-14 are lateralized; the rest drop any suffix
fn normalize_station(num: Option<&str>, lat: Option<&str>) -> Option<String> {
    let num = num?;
    let lateralized = matches!(num, "2" | "4" | "10" | "11" | "12" | "13" | "14");
    match lat {
        Some(l) if lateralized => Some(format!("{}{}", num, l.to_uppercase())),
        _ => Some(num.to_string()),
    }
}

fn map_lobe(raw: &str) -> Option<String> {
    let key = raw.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let mapped = match key.as_str() {
        "rul" | "right upper" => "RUL",
        "rml" | "right middle" => "RML",
        "rll" | "right lower" => "RLL",
        "lul" | "left upper" => "LUL",
        "lll" | "left lower" => "LLL",
        "lingula" => "LINGULA",
        _ => return None,
    };
    Some(mapped.to_string())
}
