//! "Why this code" explainer
//!
//! Deterministic and source-only: the justification is assembled from the
//! matched note spans and the rule that emitted the code. No model is
//! consulted.

use crate::coding::{CodeBundle, NoteCase};

/// Justify one code from a bundle. Returns a human-readable sentence chain
/// listing the matched spans and the applied rule.
pub fn explain_code(bundle: &CodeBundle, case: &NoteCase, code: &str) -> String {
    let Some(line) = bundle.all_codes().into_iter().find(|l| l.code == code) else {
        if let Some(suppressed) = bundle.suppressed.iter().find(|s| s.code == code) {
            return format!("{} was suppressed: {}.", code, suppressed.reason);
        }
        return format!("{} was not emitted for this note.", code);
    };

    let mut parts = Vec::new();

    if line.description.is_empty() {
        parts.push(format!("{}: {}", line.code, line.rationale));
    } else {
        parts.push(format!("{} ({}): {}", line.code, line.description, line.rationale));
    }

    if line.quantity > 1 {
        parts.push(format!("Billed quantity {}", line.quantity));
    }

    if !line.modifiers.is_empty() {
        parts.push(format!("Modifiers: {}", line.modifiers.join(", ")));
    }

    if !line.spans.is_empty() {
        let mut spans = line.spans.clone();
        spans.sort();
        spans.dedup();
        parts.push(format!(
            "Matched note spans: {}",
            spans
                .iter()
                .map(|s| format!("\"{}\"", s))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    if !case.stations.is_empty() && line.rule.starts_with("ebus_tbna") {
        parts.push(format!(
            "Stations documented: {}",
            case.stations
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    parts.push(format!("Rule applied: {}", line.rule));

    format!("{}.", parts.join(". "))
}
