//! Safety layer: emergency detection and pre/post-synthesis checks
//!
//! The pre-check inspects the query alone and can force routing to the
//! emergency fast path. The post-check audits the drafted answer against its
//! grounding chunks for unsupported dose claims and missing contraindication
//! coverage.

use crate::config::SafetyConfig;
use crate::retrieval::{QueryClass, RetrievedHit};
use regex::Regex;

/// Result of the query-only pre-check
#[derive(Debug, Clone, Default)]
pub struct PreCheck {
    pub is_emergency: bool,
    /// Label of the matched emergency pattern, when any
    pub emergency_kind: Option<String>,
    pub warnings: Vec<String>,
}

/// Result of the draft audit
#[derive(Debug, Clone, Default)]
pub struct PostCheck {
    pub review_required: bool,
    pub warnings: Vec<String>,
}

/// A numeric dose mention: value plus lowercased unit
#[derive(Debug, Clone, PartialEq)]
struct DoseMention {
    value: f32,
    unit: String,
}

/// Compiled safety screen. Built once from config at startup.
pub struct SafetyScreen {
    emergency: Vec<Regex>,
    pediatric_keywords: Vec<String>,
    dose_pattern: Regex,
    config: SafetyConfig,
}

impl SafetyScreen {
    pub fn new(config: SafetyConfig) -> crate::Result<Self> {
        let emergency = config
            .emergency_patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p)).map_err(|e| {
                    crate::IpError::Config(format!("Invalid emergency pattern '{}': {}", p, e))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            emergency,
            pediatric_keywords: config
                .pediatric_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            dose_pattern: Regex::new(
                r"(?i)\b(\d+(?:\.\d+)?)\s*(mg/kg|ml/kg|mcg|mg|ml|joules?|watts?)\b",
            )
            .expect("static regex"),
            config,
        })
    }

    /// Does the query trip an emergency pattern?
    pub fn detect_emergency(&self, query: &str) -> Option<String> {
        self.emergency
            .iter()
            .find_map(|p| p.find(query).map(|m| m.as_str().to_string()))
    }

    /// Query-only screen, independent of retrieval
    pub fn pre_check(&self, query: &str) -> PreCheck {
        let query_lower = query.to_lowercase();
        let mut check = PreCheck::default();

        if let Some(matched) = self.detect_emergency(&query_lower) {
            check.is_emergency = true;
            check.emergency_kind = Some(matched.clone());
            check
                .warnings
                .push(format!("emergency pattern detected: {}", matched));
        }

        if self
            .pediatric_keywords
            .iter()
            .any(|k| query_lower.contains(k.as_str()))
        {
            check.warnings.push(
                "pediatric context detected: verify weight-based dosing against a pediatric reference"
                    .to_string(),
            );
        }

        if self.dose_pattern.is_match(&query_lower) {
            check.warnings.push(
                "query contains absolute dose values: answer must ground every dose claim"
                    .to_string(),
            );
        }

        // Known hazard: self-expanding metal stents in benign disease
        if (query_lower.contains("sems") || query_lower.contains("self-expanding metal stent"))
            && (query_lower.contains("benign") || query_lower.contains("non-malignant"))
        {
            check.warnings.push(
                "SEMS in benign airway disease: contraindicated in resectable disease".to_string(),
            );
        }

        check
    }

    /// Audit the drafted answer against its grounding set
    pub fn post_check(&self, draft: &str, grounding: &[RetrievedHit], class: QueryClass) -> PostCheck {
        let mut check = PostCheck::default();

        for claim in self.doses_in(draft) {
            let supporting = grounding
                .iter()
                .filter(|hit| {
                    self.doses_in(&hit.chunk.text).iter().any(|d| {
                        d.unit == claim.unit && within_variance(d.value, claim.value, self.config.dose_variance_pct)
                    })
                })
                .count();

            if supporting < self.config.dose_confirm_min_sources {
                check.review_required = true;
                check.warnings.push(format!(
                    "unsupported dose claim: {} {} appears in {} grounding chunk(s), {} required",
                    claim.value, claim.unit, supporting, self.config.dose_confirm_min_sources
                ));
            }
        }

        if class == QueryClass::Safety {
            let grounding_has_contraindication = grounding
                .iter()
                .any(|hit| hit.chunk.tags.has_contraindication);
            let draft_mentions = draft.to_lowercase().contains("contraindicat");

            if grounding_has_contraindication && !draft_mentions {
                check.review_required = true;
                check.warnings.push(
                    "draft omits contraindications present in the grounding evidence".to_string(),
                );
            }
        }

        check
    }

    fn doses_in(&self, text: &str) -> Vec<DoseMention> {
        self.dose_pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let value: f32 = caps.get(1)?.as_str().parse().ok()?;
                let unit = caps.get(2)?.as_str().to_lowercase();
                Some(DoseMention { value, unit })
            })
            .collect()
    }
}

fn within_variance(a: f32, b: f32, pct: f32) -> bool {
    if b == 0.0 {
        return a == 0.0;
    }
    ((a - b) / b).abs() * 100.0 <= pct
}

/// Canned emergency response rendered without LLM synthesis
pub fn emergency_template(kind: &str, hits: &[RetrievedHit]) -> String {
    let mut out = String::from("EMERGENCY PROTOCOL\n\n");

    let actions = if kind.contains("hemoptysis") || kind.contains("bleeding") || kind.contains("hemorrhage") {
        &[
            "Place patient in lateral decubitus position, bleeding side down",
            "Secure the airway; consider intubation with a large ETT (>= 8.0)",
            "Bronchoscopy for localization; balloon tamponade for temporary control",
            "Prepare for bronchial artery embolization",
            "ICU admission required",
        ][..]
    } else if kind.contains("foreign body") {
        &[
            "Maintain spontaneous ventilation if possible",
            "Prepare rigid bronchoscopy setup with optical forceps",
            "Ensure backup surgical team availability",
        ][..]
    } else if kind.contains("pneumothorax") {
        &[
            "Needle decompression, second intercostal space midclavicular line",
            "Prepare for chest tube insertion",
            "100% oxygen; monitor for re-expansion pulmonary edema",
        ][..]
    } else {
        &[
            "Secure the airway and stabilize the patient",
            "Escalate to the on-call interventional team immediately",
        ][..]
    };

    for (i, action) in actions.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, action));
    }

    if !hits.is_empty() {
        out.push_str("\nKey evidence:\n");
        for hit in hits {
            out.push_str(&format!(
                "- [{:?} {}] {} ({})\n",
                hit.chunk.authority_tier, hit.chunk.year, hit.chunk.section_title, hit.chunk.doc_id
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_fixtures::chunk;
    use crate::retrieval::{RawScores, SourceFlags};
    use std::sync::Arc;

    fn screen() -> SafetyScreen {
        SafetyScreen::new(SafetyConfig::default()).unwrap()
    }

    fn hit_with_text(id: &str, text: &str, has_contraindication: bool) -> RetrievedHit {
        let mut c = chunk(id, text);
        c.tags.has_contraindication = has_contraindication;
        RetrievedHit {
            chunk: Arc::new(c),
            raw: RawScores::default(),
            precedence: 0.9,
            final_score: 0.9,
            sources: SourceFlags::default(),
            exact_cpt: false,
        }
    }

    #[test]
    fn test_emergency_detection() {
        let s = screen();
        let check = s.pre_check("management of massive hemoptysis >200 ml");
        assert!(check.is_emergency);
        assert!(check.emergency_kind.unwrap().contains("massive hemoptysis"));
    }

    #[test]
    fn test_non_emergency() {
        let s = screen();
        let check = s.pre_check("stent sizing for subglottic stenosis");
        assert!(!check.is_emergency);
    }

    #[test]
    fn test_pediatric_warning() {
        let s = screen();
        let check = s.pre_check("sedation dosing for a pediatric patient");
        assert!(check
            .warnings
            .iter()
            .any(|w| w.contains("pediatric context")));
    }

    #[test]
    fn test_sems_benign_warning() {
        let s = screen();
        let check = s.pre_check("sems (self-expanding metal stent) benign tracheal stenosis");
        assert!(check
            .warnings
            .iter()
            .any(|w| w.contains("contraindicated in resectable disease")));
    }

    #[test]
    fn test_dose_claim_requires_two_sources() {
        let s = screen();
        let draft = "Use 40 watts for ablation.";

        // Only one supporting chunk: flagged
        let grounding = vec![hit_with_text("g1", "settings of 40 watts are typical", false)];
        let check = s.post_check(draft, &grounding, QueryClass::Clinical);
        assert!(check.review_required);

        // Two chunks within variance: passes
        let grounding = vec![
            hit_with_text("g1", "settings of 40 watts are typical", false),
            hit_with_text("g2", "power of 38 watts was used", false),
        ];
        let check = s.post_check(draft, &grounding, QueryClass::Clinical);
        assert!(!check.review_required);
    }

    #[test]
    fn test_dose_variance_bound() {
        let s = screen();
        let draft = "Administer 100 mg.";
        let grounding = vec![
            hit_with_text("g1", "a dose of 150 mg was reported", false),
            hit_with_text("g2", "another 150 mg report", false),
        ];
        // 150 vs 100 exceeds the 20% window
        let check = s.post_check(draft, &grounding, QueryClass::Clinical);
        assert!(check.review_required);
    }

    #[test]
    fn test_missing_contraindication_coverage() {
        let s = screen();
        let grounding = vec![hit_with_text(
            "g1",
            "SEMS are contraindicated in resectable benign disease",
            true,
        )];

        let bad_draft = "Metal stents are an option for benign stenosis.";
        let check = s.post_check(bad_draft, &grounding, QueryClass::Safety);
        assert!(check.review_required);

        let good_draft = "Metal stents are contraindicated in resectable benign disease.";
        let check = s.post_check(good_draft, &grounding, QueryClass::Safety);
        assert!(!check.review_required);
    }

    #[test]
    fn test_emergency_template_lists_evidence() {
        let hits = vec![hit_with_text("g1", "airway bleeding control", false)];
        let text = emergency_template("massive hemoptysis", &hits);
        assert!(text.contains("EMERGENCY PROTOCOL"));
        assert!(text.contains("lateral decubitus"));
        assert!(text.contains("doc-g1"));
    }
}
