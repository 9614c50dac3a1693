//! Operative-note extraction: patterns in, PerformedItems out
//!
//! Each pattern family emits zero or more items with site, count, and the
//! matched spans kept for the explainer. Matches inside declination language
//! are dropped by the negative-mention guard. No model in the loop.

use crate::coding::patterns::NotePatterns;
use crate::coding::{NoteCase, PerformedItem, ProcedureKind, SedationInfo, Site};
use crate::text::TextNormalizer;
use regex::Regex;
use std::collections::BTreeMap;

/// Notes longer than this with zero extracted items are flagged low
/// confidence rather than silently returning an empty bundle
const LOW_CONFIDENCE_TOKEN_FLOOR: usize = 50;

/// Extract a structured case from one operative note
pub fn extract_case(note: &str, patterns: &NotePatterns) -> NoteCase {
    let text = TextNormalizer::new().normalize(note);

    let mut case = NoteCase {
        stations: patterns.extract_stations(&text),
        lobes: patterns.extract_lobes(&text),
        laterality: Some(patterns.laterality(&text)),
        sedation: extract_sedation(&text, patterns),
        explicit_cpts: patterns
            .cpt_token
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .collect(),
        note_text: text.clone(),
        items: Vec::new(),
        low_confidence: false,
        warnings: Vec::new(),
    };

    extract_stents(&text, patterns, &mut case);
    extract_dilation(&text, patterns, &mut case);
    extract_tumor_work(&text, patterns, &mut case);
    extract_lavage(&text, patterns, &mut case);
    extract_ebus(&text, patterns, &mut case);
    extract_tblb(&text, patterns, &mut case);

    if case.items.is_empty()
        && text.split_whitespace().count() > LOW_CONFIDENCE_TOKEN_FLOOR
    {
        case.low_confidence = true;
        case.warnings.push(
            "coding_low_confidence: no procedure patterns matched; manual coding required"
                .to_string(),
        );
    }

    case
}

/// Matches of `pattern` that survive the negation guard
fn live_spans(text: &str, pattern: &Regex, patterns: &NotePatterns) -> Vec<String> {
    pattern
        .find_iter(text)
        .filter(|m| !patterns.is_negated(text, m.start(), m.end()))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn push_item(case: &mut NoteCase, mut item: PerformedItem) {
    if let Some(existing) = case.items.iter_mut().find(|i| i.kind == item.kind) {
        existing.spans.append(&mut item.spans);
        existing.count = existing.count.max(item.count);
        existing.specimens_collected |= item.specimens_collected;
        return;
    }
    case.items.push(item);
}

fn extract_stents(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let mut spans = live_spans(text, &patterns.stent_brand, patterns);
    spans.extend(live_spans(text, &patterns.stent_generic, patterns));
    if spans.is_empty() {
        return;
    }

    let mut details = BTreeMap::new();
    if let Some(brand) = patterns.stent_brand.find(text) {
        details.insert("brand".to_string(), brand.as_str().to_string());
    }
    if let Some(size) = patterns.stent_size.find(text) {
        details.insert("size".to_string(), size.as_str().to_string());
    }

    // A Y-stent bridges the carina and codes as tracheal
    let y_stent = !live_spans(text, &patterns.y_stent, patterns).is_empty();
    let tracheal = y_stent || patterns.tracheal_terms.is_match(text);
    let bronchial = !y_stent && patterns.bronchial_terms.is_match(text);

    if tracheal {
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::TrachealStentInsertion,
                site: Site::Trachea,
                details: details.clone(),
                count: 1,
                specimens_collected: false,
                spans: spans.clone(),
            },
        );
    }

    if bronchial || !tracheal {
        let count = if patterns.multiple_bronchial_stents.is_match(text) {
            2
        } else {
            1
        };
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::BronchialStentInsertion,
                site: if bronchial { Site::Bronchus } else { Site::Unknown },
                details,
                count,
                specimens_collected: false,
                spans,
            },
        );
    }
}

fn extract_dilation(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let spans = live_spans(text, &patterns.dilation, patterns);
    if spans.is_empty() {
        return;
    }

    let site = if patterns.tracheal_terms.is_match(text) {
        Site::Trachea
    } else if patterns.bronchial_terms.is_match(text) {
        Site::Bronchus
    } else {
        Site::Unknown
    };

    push_item(
        case,
        PerformedItem {
            kind: ProcedureKind::AirwayDilationOnly,
            site,
            details: BTreeMap::new(),
            count: 1,
            specimens_collected: false,
            spans,
        },
    );
}

fn extract_tumor_work(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let site = if patterns.tracheal_terms.is_match(text) {
        Site::Trachea
    } else if patterns.bronchial_terms.is_match(text) {
        Site::Bronchus
    } else {
        Site::Unknown
    };

    let excision_spans = live_spans(text, &patterns.excision, patterns);
    if !excision_spans.is_empty() {
        let specimens = patterns.specimen.is_match(text);
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::TumorExcisionBronchoscopic,
                site,
                details: BTreeMap::new(),
                count: 1,
                specimens_collected: specimens,
                spans: excision_spans,
            },
        );
    }

    let destruction_spans = live_spans(text, &patterns.destruction, patterns);
    if !destruction_spans.is_empty() {
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::TumorDestructionBronchoscopic,
                site,
                details: BTreeMap::new(),
                count: 1,
                specimens_collected: false,
                spans: destruction_spans,
            },
        );
    }
}

fn extract_lavage(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let spans = live_spans(text, &patterns.whole_lung_lavage, patterns);
    if spans.is_empty() {
        return;
    }
    push_item(
        case,
        PerformedItem {
            kind: ProcedureKind::WholeLungLavage,
            site: Site::Lobe,
            details: BTreeMap::new(),
            count: 1,
            specimens_collected: false,
            spans,
        },
    );
}

fn extract_ebus(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let ebus_spans = live_spans(text, &patterns.ebus, patterns);
    if ebus_spans.is_empty() {
        return;
    }

    let tbna = patterns.tbna.is_match(text);
    let radial_only = patterns.radial_ebus.is_match(text) && !tbna;

    if tbna && !radial_only {
        let mut details = BTreeMap::new();
        details.insert(
            "stations".to_string(),
            case.stations.iter().cloned().collect::<Vec<_>>().join(","),
        );
        let count = case.stations.len().max(1) as u32;
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::EbusTbna,
                site: Site::Unknown,
                details,
                count,
                specimens_collected: true,
                spans: ebus_spans,
            },
        );
    } else {
        push_item(
            case,
            PerformedItem {
                kind: ProcedureKind::EbusWithoutTbna,
                site: Site::Unknown,
                details: BTreeMap::new(),
                count: 1,
                specimens_collected: false,
                spans: ebus_spans,
            },
        );
    }
}

fn extract_tblb(text: &str, patterns: &NotePatterns, case: &mut NoteCase) {
    let spans = live_spans(text, &patterns.tblb, patterns);
    if spans.is_empty() {
        return;
    }
    push_item(
        case,
        PerformedItem {
            kind: ProcedureKind::TblbForcepsOrCryo,
            site: Site::Lobe,
            details: BTreeMap::new(),
            count: case.lobes.len().max(1) as u32,
            specimens_collected: true,
            spans,
        },
    );
}

fn extract_sedation(text: &str, patterns: &NotePatterns) -> SedationInfo {
    let general_anesthesia = patterns.general_anesthesia.is_match(text);
    let moderate = patterns.moderate_sedation.is_match(text);

    let mut total_minutes = patterns.sedation_minutes.captures(text).and_then(|caps| {
        caps.name("mins")
            .or_else(|| caps.name("mins2"))
            .and_then(|m| m.as_str().parse().ok())
    });

    let times = patterns.hhmm_times.captures(text);
    let times_documented = times.is_some();
    if total_minutes.is_none() {
        if let Some(caps) = times {
            total_minutes = span_minutes(&caps[1], &caps[2]);
        }
    }

    SedationInfo {
        general_anesthesia,
        moderate_sedation_documented: moderate,
        total_minutes,
        times_documented,
        separate_provider: patterns.separate_provider.is_match(text),
    }
}

/// Minutes between two HH:MM stamps, rolling over midnight
fn span_minutes(start: &str, end: &str) -> Option<u32> {
    let parse = |s: &str| -> Option<i32> {
        let (h, m) = s.split_once(':')?;
        let h: i32 = h.parse().ok()?;
        let m: i32 = m.parse().ok()?;
        if h > 23 || m > 59 {
            return None;
        }
        Some(h * 60 + m)
    };
    let start = parse(start)?;
    let end = parse(end)?;
    Some(((end - start).rem_euclid(24 * 60)) as u32)
}
