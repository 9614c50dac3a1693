//! Precedence model: authority tiers, evidence levels, and recency decay
//!
//! Combines into a single score in [0, 1] with two guard rails: the A1 floor
//! (flagship textbook content never decays below 0.7 recency weight) and the
//! standard-of-care guard (an article only displaces A1 content when it is
//! strong evidence and clearly newer).

use crate::config::{Config, PrecedenceConfig};
use crate::corpus::{AuthorityTier, Chunk, Domain, EvidenceLevel};
use crate::retrieval::RetrievedHit;

/// Precedence scorer, fixed at construction for a server lifetime
#[derive(Debug, Clone)]
pub struct PrecedenceModel {
    config: PrecedenceConfig,
    current_year: i32,
}

impl PrecedenceModel {
    pub fn new(config: PrecedenceConfig, current_year: i32) -> Self {
        Self {
            config,
            current_year,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        use chrono::Datelike;
        Self::new(config.precedence.clone(), chrono::Utc::now().year())
    }

    fn halflife(&self, domain: Domain) -> f32 {
        match domain {
            Domain::Clinical => self.config.halflife_clinical,
            Domain::CodingBilling => self.config.halflife_coding_billing,
            Domain::Ablation => self.config.halflife_ablation,
            Domain::LungVolumeReduction => self.config.halflife_lung_volume_reduction,
            Domain::TechnologyNavigation => self.config.halflife_technology_navigation,
        }
    }

    /// Exponential recency decay with the A1 floor applied
    pub fn recency(&self, chunk: &Chunk) -> f32 {
        let age = (self.current_year - chunk.year).max(0) as f32;
        let decay = 0.5f32.powf(age / self.halflife(chunk.domain));

        if chunk.authority_tier == AuthorityTier::A1 {
            decay.max(self.config.a1_floor)
        } else {
            decay
        }
    }

    /// Composite precedence score in [0, 1]
    pub fn precedence(&self, chunk: &Chunk) -> f32 {
        self.config.recency_weight * self.recency(chunk)
            + self.config.evidence_weight * chunk.evidence_level.weight()
            + self.config.authority_weight * chunk.authority_tier.weight()
    }

    /// Coding content older than its half-life plus one year is stale and
    /// must be surfaced as a warning by the citation layer
    pub fn is_stale_coding(&self, chunk: &Chunk) -> bool {
        chunk.domain == Domain::CodingBilling
            && (self.current_year - chunk.year) as f32 > self.halflife(chunk.domain) + 1.0
    }

    /// Standard-of-care guard over a score-sorted candidate list.
    ///
    /// Where an A4 chunk sits directly above an A1 chunk on the same topic
    /// cluster (shared alias), the A4 keeps its spot only when it is H1/H2
    /// evidence and at least 3 years newer; otherwise the pair swaps.
    pub fn apply_standard_of_care_guard(&self, hits: &mut [RetrievedHit]) {
        if hits.len() < 2 {
            return;
        }

        // One bubble pass per slot bounds the cascade
        for _ in 0..hits.len() {
            let mut swapped = false;
            for i in 0..hits.len() - 1 {
                let (upper, lower) = (&hits[i], &hits[i + 1]);
                if upper.chunk.authority_tier != AuthorityTier::A4
                    || lower.chunk.authority_tier != AuthorityTier::A1
                {
                    continue;
                }
                if upper.chunk.aliases.is_disjoint(&lower.chunk.aliases) {
                    continue;
                }

                let strong_evidence = matches!(
                    upper.chunk.evidence_level,
                    EvidenceLevel::H1 | EvidenceLevel::H2
                );
                let clearly_newer = upper.chunk.year >= lower.chunk.year + 3;

                if !(strong_evidence && clearly_newer) {
                    hits.swap(i, i + 1);
                    swapped = true;
                }
            }
            if !swapped {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_fixtures::chunk;
    use crate::retrieval::{RawScores, SourceFlags};
    use std::sync::Arc;

    fn model() -> PrecedenceModel {
        PrecedenceModel::new(PrecedenceConfig::default(), 2025)
    }

    fn hit(c: Chunk, score: f32) -> RetrievedHit {
        RetrievedHit {
            precedence: 0.0,
            final_score: score,
            raw: RawScores::default(),
            sources: SourceFlags::default(),
            exact_cpt: false,
            chunk: Arc::new(c),
        }
    }

    #[test]
    fn test_recency_decay() {
        let m = model();
        let mut c = chunk("c1", "text");
        c.authority_tier = AuthorityTier::A4;
        c.domain = Domain::Clinical; // half-life 6

        c.year = 2025;
        assert!((m.recency(&c) - 1.0).abs() < 1e-6);

        c.year = 2019; // one half-life
        assert!((m.recency(&c) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_a1_floor() {
        let m = model();
        let mut c = chunk("c1", "text");
        c.authority_tier = AuthorityTier::A1;
        c.year = 1990;
        assert!(m.recency(&c) >= 0.7);

        c.authority_tier = AuthorityTier::A3;
        assert!(m.recency(&c) < 0.7);
    }

    #[test]
    fn test_precedence_in_unit_range() {
        let m = model();
        for tier in [
            AuthorityTier::A1,
            AuthorityTier::A2,
            AuthorityTier::A3,
            AuthorityTier::A4,
        ] {
            for level in [
                EvidenceLevel::H1,
                EvidenceLevel::H2,
                EvidenceLevel::H3,
                EvidenceLevel::H4,
            ] {
                for year in [1980, 2000, 2020, 2025] {
                    let mut c = chunk("c", "text");
                    c.authority_tier = tier;
                    c.evidence_level = level;
                    c.year = year;
                    let p = m.precedence(&c);
                    assert!((0.0..=1.0).contains(&p), "precedence {} out of range", p);
                }
            }
        }
    }

    #[test]
    fn test_stale_coding() {
        let m = model();
        let mut c = chunk("c1", "text");
        c.domain = Domain::CodingBilling; // half-life 3, stale past 4 years

        c.year = 2022;
        assert!(!m.is_stale_coding(&c));

        c.year = 2020;
        assert!(m.is_stale_coding(&c));

        c.domain = Domain::Clinical;
        assert!(!m.is_stale_coding(&c));
    }

    #[test]
    fn test_guard_demotes_weak_article() {
        let m = model();

        let mut article = chunk("a", "newer take");
        article.authority_tier = AuthorityTier::A4;
        article.evidence_level = EvidenceLevel::H3; // weak evidence
        article.year = 2025;
        article.aliases.insert("sems".to_string());

        let mut textbook = chunk("t", "flagship chapter");
        textbook.authority_tier = AuthorityTier::A1;
        textbook.year = 2024;
        textbook.aliases.insert("sems".to_string());

        let mut hits = vec![hit(article, 0.9), hit(textbook, 0.8)];
        m.apply_standard_of_care_guard(&mut hits);

        assert_eq!(hits[0].chunk_id(), "t");
        assert_eq!(hits[1].chunk_id(), "a");
    }

    #[test]
    fn test_guard_allows_strong_newer_article() {
        let m = model();

        let mut article = chunk("a", "rct results");
        article.authority_tier = AuthorityTier::A4;
        article.evidence_level = EvidenceLevel::H2;
        article.year = 2024;
        article.aliases.insert("blvr".to_string());

        let mut textbook = chunk("t", "older chapter");
        textbook.authority_tier = AuthorityTier::A1;
        textbook.year = 2019;
        textbook.aliases.insert("blvr".to_string());

        let mut hits = vec![hit(article, 0.9), hit(textbook, 0.8)];
        m.apply_standard_of_care_guard(&mut hits);

        assert_eq!(hits[0].chunk_id(), "a");
    }

    #[test]
    fn test_guard_ignores_different_topics() {
        let m = model();

        let mut article = chunk("a", "article");
        article.authority_tier = AuthorityTier::A4;
        article.evidence_level = EvidenceLevel::H4;
        article.year = 2025;
        article.aliases.insert("valves".to_string());

        let mut textbook = chunk("t", "chapter");
        textbook.authority_tier = AuthorityTier::A1;
        textbook.year = 2024;
        textbook.aliases.insert("stent".to_string());

        let mut hits = vec![hit(article, 0.9), hit(textbook, 0.8)];
        m.apply_standard_of_care_guard(&mut hits);

        assert_eq!(hits[0].chunk_id(), "a");
    }
}
