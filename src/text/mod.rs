//! Text normalization applied at every text boundary
//!
//! Cleans ligature artifacts and publisher escapes left over from PDF
//! extraction, repairs hyphenated line breaks, collapses doubled
//! abbreviation expansions, and canonicalizes whitespace. Normalization is
//! idempotent: `normalize(normalize(x)) == normalize(x)`.

use regex::Regex;

/// Ligature codepoints and publisher escape sequences mapped to plain text
const LIGATURES: &[(&str, &str)] = &[
    ("/uniFB01", "fi"),
    ("/uniFB02", "fl"),
    ("/uniFB03", "ffi"),
    ("/uniFB04", "ffl"),
    ("\u{fb00}", "ff"),
    ("\u{fb01}", "fi"),
    ("\u{fb02}", "fl"),
    ("\u{fb03}", "ffi"),
    ("\u{fb04}", "ffl"),
    ("\u{fb05}", "st"),
    ("\u{fb06}", "st"),
];

/// Publisher artifact escapes that carry no text content
const ARTIFACTS: &[&str] = &["/C21", "/C14", "/C15", "/C23", "/C210", "/C211"];

/// Compiled text normalizer. Build once, reuse everywhere.
pub struct TextNormalizer {
    hyphen_break: Regex,
    trailing_ws: Regex,
    blank_runs: Regex,
    double_expansion: Regex,
    empty_brackets: Regex,
    page_artifacts: Regex,
    space_runs: Regex,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextNormalizer {
    pub fn new() -> Self {
        Self {
            hyphen_break: Regex::new(r"(\w)-\n(\w)").expect("static regex"),
            trailing_ws: Regex::new(r"[ \t]+\n").expect("static regex"),
            blank_runs: Regex::new(r"\n{3,}").expect("static regex"),
            // "long form (long form (ABBR))" -> "long form (ABBR)"
            double_expansion: Regex::new(
                r"(?i)\b([a-z][a-z \-]{3,60}?)\s*\(\s*([a-z][a-z \-]{3,60}?)\s*\(([A-Za-z][A-Za-z\-]{1,9})\)\s*\)",
            )
            .expect("static regex"),
            empty_brackets: Regex::new(r"\[\s*\]").expect("static regex"),
            page_artifacts: Regex::new(r"Page \d+ of \d+|\d+\s*\|\s*P a g e").expect("static regex"),
            space_runs: Regex::new(r"[ \t]{2,}").expect("static regex"),
        }
    }

    /// Normalize a block of corpus or note text
    pub fn normalize(&self, text: &str) -> String {
        let mut s = text.to_string();

        for (from, to) in LIGATURES {
            s = s.replace(from, to);
        }
        for artifact in ARTIFACTS {
            s = s.replace(artifact, "");
        }

        s = self.hyphen_break.replace_all(&s, "${1}${2}").into_owned();
        s = self.trailing_ws.replace_all(&s, "\n").into_owned();
        s = self.blank_runs.replace_all(&s, "\n\n").into_owned();
        s = self
            .double_expansion
            .replace_all(&s, |caps: &regex::Captures| {
                // Collapse only when the duplicated long form matches
                let outer = caps.get(1).map_or("", |m| m.as_str()).trim();
                let inner = caps.get(2).map_or("", |m| m.as_str()).trim();
                let abbr = caps.get(3).map_or("", |m| m.as_str());
                if outer.eq_ignore_ascii_case(inner) {
                    format!("{} ({})", outer, abbr)
                } else {
                    caps.get(0).map_or("", |m| m.as_str()).to_string()
                }
            })
            .into_owned();
        s = self.empty_brackets.replace_all(&s, "").into_owned();
        s = self.page_artifacts.replace_all(&s, "").into_owned();
        s = self.space_runs.replace_all(&s, " ").into_owned();

        s.trim().to_string()
    }
}
