//! Deterministic procedural coding from operative notes
//!
//! Pipeline: `note_text -> extract(PerformedItems) -> rules(KB) -> CodeBundle`.
//! Extraction is pattern-based with no model in the loop; the rule engine
//! reads a versioned KB JSON and applies suppression, bundling, and modifier
//! rules; the explainer justifies each emitted code from matched note spans.

mod explain;
mod extract;
mod kb;
mod patterns;
mod rules;

pub use explain::explain_code;
pub use extract::extract_case;
pub use kb::{CodingKb, KbError, NcciEdit};
pub use patterns::{Laterality, NotePatterns};
pub use rules::code_case;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Anatomic site of a performed procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    Trachea,
    Bronchus,
    Lobe,
    Unknown,
}

/// Closed set of extractable procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    TumorExcisionBronchoscopic,
    TumorDestructionBronchoscopic,
    TrachealStentInsertion,
    BronchialStentInsertion,
    AirwayDilationOnly,
    WholeLungLavage,
    EbusTbna,
    EbusWithoutTbna,
    TblbForcepsOrCryo,
}

impl ProcedureKind {
    /// KB id for crosswalk lookups
    pub fn id(self) -> &'static str {
        match self {
            ProcedureKind::TumorExcisionBronchoscopic => "tumor_excision_bronchoscopic",
            ProcedureKind::TumorDestructionBronchoscopic => "tumor_destruction_bronchoscopic",
            ProcedureKind::TrachealStentInsertion => "tracheal_stent_insertion",
            ProcedureKind::BronchialStentInsertion => "bronchial_stent_insertion",
            ProcedureKind::AirwayDilationOnly => "airway_dilation_only",
            ProcedureKind::WholeLungLavage => "whole_lung_lavage",
            ProcedureKind::EbusTbna => "ebus_tbna",
            ProcedureKind::EbusWithoutTbna => "ebus_without_tbna",
            ProcedureKind::TblbForcepsOrCryo => "tblb_forceps_or_cryo",
        }
    }
}

/// One procedure read out of the note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformedItem {
    pub kind: ProcedureKind,
    pub site: Site,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub count: u32,
    pub specimens_collected: bool,
    /// Note spans that produced this item (for the explainer)
    #[serde(default)]
    pub spans: Vec<String>,
}

/// Sedation facts read from the note
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SedationInfo {
    pub general_anesthesia: bool,
    pub moderate_sedation_documented: bool,
    pub total_minutes: Option<u32>,
    pub times_documented: bool,
    pub separate_provider: bool,
}

/// Everything extracted from one operative note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteCase {
    pub note_text: String,
    pub items: Vec<PerformedItem>,
    pub stations: BTreeSet<String>,
    pub lobes: BTreeSet<String>,
    #[serde(skip)]
    pub laterality: Option<Laterality>,
    pub sedation: SedationInfo,
    pub explicit_cpts: BTreeSet<String>,
    pub low_confidence: bool,
    pub warnings: Vec<String>,
}

/// One emitted code with its justification material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeLine {
    pub code: String,
    pub description: String,
    pub quantity: u32,
    #[serde(default)]
    pub modifiers: Vec<String>,
    pub rationale: String,
    /// Rule identifier for the explainer
    pub rule: String,
    #[serde(default)]
    pub spans: Vec<String>,
}

impl CodeLine {
    pub fn new(code: impl Into<String>, rule: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
            quantity: 1,
            modifiers: Vec::new(),
            rationale: rationale.into(),
            rule: rule.into(),
            spans: Vec::new(),
        }
    }
}

/// A code dropped by a suppression rule, with the reason kept for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressedCode {
    pub code: String,
    pub reason: String,
}

/// Output of the rule engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeBundle {
    pub primary_cpts: Vec<CodeLine>,
    pub add_on_cpts: Vec<CodeLine>,
    pub hcpcs: Vec<CodeLine>,
    pub modifiers: Vec<String>,
    pub sedation_family: Option<String>,
    pub icd10_pcs: Vec<String>,
    pub suppressed: Vec<SuppressedCode>,
    pub warnings: Vec<String>,
    pub documentation_gaps: Vec<String>,
    pub kb_version: String,
}

impl CodeBundle {
    /// Every emitted CPT/HCPCS code, primaries first
    pub fn all_codes(&self) -> Vec<&CodeLine> {
        self.primary_cpts
            .iter()
            .chain(self.add_on_cpts.iter())
            .chain(self.hcpcs.iter())
            .collect()
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.all_codes().iter().any(|line| line.code == code)
    }
}

/// Coding request record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingRequest {
    pub note: String,
    #[serde(default)]
    pub patient_ctx: Option<PatientContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientContext {
    #[serde(default)]
    pub age_years: Option<u32>,
}

/// Coding response record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingResponse {
    pub primary_cpts: Vec<CodeLine>,
    pub add_on_cpts: Vec<CodeLine>,
    pub hcpcs: Vec<CodeLine>,
    pub modifiers: Vec<String>,
    pub sedation_family: Option<String>,
    pub icd10_pcs: Vec<String>,
    pub suppressed: Vec<SuppressedCode>,
    pub warnings: Vec<String>,
    pub kb_version: String,
    pub explanations: BTreeMap<String, String>,
}

/// Full coding pipeline over one note
pub fn code_note(request: &CodingRequest, kb: &CodingKb) -> CodingResponse {
    let patterns = NotePatterns::new();
    let case = extract_case(&request.note, &patterns);
    let bundle = code_case(&case, request.patient_ctx.as_ref(), kb);

    let mut explanations = BTreeMap::new();
    for line in bundle.all_codes() {
        explanations.insert(line.code.clone(), explain_code(&bundle, &case, &line.code));
    }

    let mut warnings = bundle.warnings.clone();
    warnings.extend(bundle.documentation_gaps.iter().cloned());

    CodingResponse {
        primary_cpts: bundle.primary_cpts,
        add_on_cpts: bundle.add_on_cpts,
        hcpcs: bundle.hcpcs,
        modifiers: bundle.modifiers,
        sedation_family: bundle.sedation_family,
        icd10_pcs: bundle.icd10_pcs,
        suppressed: bundle.suppressed,
        warnings,
        kb_version: bundle.kb_version,
        explanations,
    }
}
