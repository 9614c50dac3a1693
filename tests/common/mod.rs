//! Shared fixtures for integration tests
//!
//! Builds a small but realistic corpus and wires the full stack against the
//! deterministic mock backends, so tests never download models.

#![allow(dead_code)]

use ipassist::citations::{CitationIndex, CitationRecord, CitationResolver};
use ipassist::config::Config;
use ipassist::corpus::{
    AuthorityTier, Chunk, ChunkStore, ChunkTags, DocType, Domain, EvidenceLevel, SectionKind,
    TermIndex,
};
use ipassist::index::mock::{MockCrossEncoder, MockEmbedder};
use ipassist::index::{DenseStore, Embedder, HnswDenseStore, SparseIndex};
use ipassist::llm::LlmClient;
use ipassist::orchestrator::Orchestrator;
use ipassist::retrieval::{CrossEncoder, HybridRetriever, PrecedenceModel};
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed "current year" so recency scores stay deterministic
pub const FIXTURE_YEAR: i32 = 2025;

/// Wire test logging once per binary; repeated calls are no-ops
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ipassist=info")),
        )
        .with_target(false)
        .try_init();
}

#[allow(clippy::too_many_arguments)]
fn chunk(
    chunk_id: &str,
    doc_id: &str,
    text: &str,
    doc_type: DocType,
    section_kind: SectionKind,
    year: i32,
    tier: AuthorityTier,
    level: EvidenceLevel,
    domain: Domain,
    aliases: &[&str],
    cpt_codes: &[&str],
    tags: ChunkTags,
) -> Chunk {
    Chunk {
        chunk_id: chunk_id.to_string(),
        text: text.to_string(),
        doc_id: doc_id.to_string(),
        doc_type,
        section_title: format!("{} section", chunk_id),
        section_kind,
        year,
        authority_tier: tier,
        evidence_level: level,
        domain,
        cpt_codes: cpt_codes.iter().map(|s| s.to_string()).collect(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        tags,
    }
}

pub fn fixture_chunks() -> Vec<Chunk> {
    let tags = ChunkTags::default();
    let contra = ChunkTags {
        has_contraindication: true,
        ..ChunkTags::default()
    };
    let emergency = ChunkTags {
        has_emergency_pattern: true,
        ..ChunkTags::default()
    };

    vec![
        chunk(
            "fid-1",
            "papoip-2025",
            "Fiducial marker placement for stereotactic radiotherapy requires 3-6 markers \
             spaced 1.5-5 cm apart in a non-collinear arrangement around the target lesion.",
            DocType::BookChapter,
            SectionKind::Procedure,
            2025,
            AuthorityTier::A1,
            EvidenceLevel::H3,
            Domain::TechnologyNavigation,
            &["fiducial marker"],
            &[],
            tags,
        ),
        chunk(
            "fid-2",
            "fiducial-cohort-2018",
            "A retrospective cohort of fiducial marker migration after bronchoscopic placement.",
            DocType::Cohort,
            SectionKind::General,
            2018,
            AuthorityTier::A4,
            EvidenceLevel::H3,
            Domain::TechnologyNavigation,
            &["fiducial marker"],
            &[],
            tags,
        ),
        chunk(
            "thor-1",
            "practical-guide-2023",
            "Competency in medical thoracoscopy requires 20 supervised procedures during \
             training and a maintenance volume of 10/year thereafter.",
            DocType::BookChapter,
            SectionKind::General,
            2023,
            AuthorityTier::A2,
            EvidenceLevel::H3,
            Domain::Clinical,
            &["medical thoracoscopy"],
            &[],
            tags,
        ),
        chunk(
            "sems-1",
            "papoip-2025",
            "Self-expanding metal stents are contraindicated in resectable disease and in \
             benign tracheal stenosis where surgical repair remains an option.",
            DocType::BookChapter,
            SectionKind::Contraindications,
            2025,
            AuthorityTier::A1,
            EvidenceLevel::H3,
            Domain::Clinical,
            &["sems", "self-expanding metal stent"],
            &[],
            contra,
        ),
        chunk(
            "hemop-1",
            "papoip-2025",
            "Management of massive hemoptysis: lateral decubitus positioning with the bleeding \
             side down, airway control with a large endotracheal tube, and early bronchial \
             artery embolization.",
            DocType::BookChapter,
            SectionKind::Procedure,
            2025,
            AuthorityTier::A1,
            EvidenceLevel::H3,
            Domain::Clinical,
            &["massive hemoptysis"],
            &[],
            emergency,
        ),
        chunk(
            "hemop-2",
            "hemoptysis-case-2021",
            "Case report: massive hemoptysis controlled with endobronchial tamponade.",
            DocType::Case,
            SectionKind::General,
            2021,
            AuthorityTier::A4,
            EvidenceLevel::H4,
            Domain::Clinical,
            &["massive hemoptysis"],
            &[],
            tags,
        ),
        chunk(
            "cpt-31622",
            "coding-primer-2020",
            "CPT 31622 covers diagnostic bronchoscopy with cell washing and is bundled into \
             any surgical bronchoscopy performed at the same session.",
            DocType::JournalArticle,
            SectionKind::Coding,
            2020,
            AuthorityTier::A4,
            EvidenceLevel::H3,
            Domain::CodingBilling,
            &["diagnostic bronchoscopy"],
            &["31622"],
            ChunkTags {
                has_table: true,
                ..ChunkTags::default()
            },
        ),
        chunk(
            "blvr-1",
            "practical-guide-2023",
            "Bronchoscopic lung volume reduction with one-way valves requires fissure \
             integrity assessment before implantation.",
            DocType::BookChapter,
            SectionKind::Blvr,
            2023,
            AuthorityTier::A2,
            EvidenceLevel::H3,
            Domain::LungVolumeReduction,
            &["blvr", "endobronchial valve"],
            &[],
            tags,
        ),
    ]
}

pub fn fixture_citation_index() -> CitationIndex {
    let mut records = HashMap::new();
    records.insert(
        "papoip-2025".to_string(),
        CitationRecord {
            authors: vec!["Ost DE".to_string(), "Ernst A".to_string()],
            year: 2025,
            title: "Principles and Practice of Interventional Pulmonology".to_string(),
            venue: String::new(),
            doc_type: DocType::BookChapter,
        },
    );
    records.insert(
        "practical-guide-2023".to_string(),
        CitationRecord {
            authors: vec!["Mehta AC".to_string()],
            year: 2023,
            title: "Practical Guide to Interventional Pulmonology".to_string(),
            venue: String::new(),
            doc_type: DocType::BookChapter,
        },
    );
    records.insert(
        "fiducial-cohort-2018".to_string(),
        CitationRecord {
            authors: vec!["Steinfort DP".to_string(), "Irving LB".to_string()],
            year: 2018,
            title: "Fiducial marker migration after bronchoscopic placement".to_string(),
            venue: "J Bronchology Interv Pulmonol".to_string(),
            doc_type: DocType::JournalArticle,
        },
    );
    records.insert(
        "hemoptysis-case-2021".to_string(),
        CitationRecord {
            authors: vec!["Davidson K".to_string()],
            year: 2021,
            title: "Endobronchial tamponade for massive hemoptysis".to_string(),
            venue: "Chest".to_string(),
            doc_type: DocType::Case,
        },
    );
    records.insert(
        "coding-primer-2020".to_string(),
        CitationRecord {
            authors: vec!["Pritchett MA".to_string()],
            year: 2020,
            title: "Bronchoscopy coding primer".to_string(),
            venue: "Chest".to_string(),
            doc_type: DocType::JournalArticle,
        },
    );
    CitationIndex::from_records(records)
}

/// Wire the full retrieval stack over the fixture corpus
pub fn build_retriever(config: &Config, with_reranker: bool) -> (Arc<ChunkStore>, Arc<HybridRetriever>) {
    init_tracing();
    let store = Arc::new(ChunkStore::from_chunks(fixture_chunks()).unwrap());
    let terms = Arc::new(TermIndex::build(&store));
    let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new());
    let dense: Arc<dyn DenseStore> = Arc::new(
        HnswDenseStore::build(&store, &MockEmbedder::new(), &config.embedding).unwrap(),
    );
    let sparse = Arc::new(SparseIndex::build(&store).unwrap());
    let reranker: Option<Arc<dyn CrossEncoder>> = if with_reranker {
        Some(Arc::new(MockCrossEncoder))
    } else {
        None
    };

    let retriever = Arc::new(HybridRetriever::new(
        store.clone(),
        terms,
        Some(sparse),
        Some(dense),
        embedder,
        reranker,
        PrecedenceModel::new(config.precedence.clone(), FIXTURE_YEAR),
        config.retrieval.clone(),
    ));

    (store, retriever)
}

/// Wire a full orchestrator against the fixture corpus
pub fn build_orchestrator(config: Config, llm: Option<Arc<dyn LlmClient>>) -> Orchestrator {
    let (store, retriever) = build_retriever(&config, true);
    let resolver = CitationResolver::new(fixture_citation_index(), &config.citation);
    let precedence = PrecedenceModel::new(config.precedence.clone(), FIXTURE_YEAR);

    Orchestrator::new(store, retriever, resolver, precedence, llm, config)
        .unwrap()
        .with_kb_version("2025.2")
}
