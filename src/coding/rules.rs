//! Deterministic rule engine: PerformedItems + KB -> CodeBundle
//!
//! Emits CPT, add-on, HCPCS, modifier, sedation-family, and ICD-10-PCS
//! suggestions under suppression, bundling (NCCI), and bilateral rules.
//! Rule failures never raise; every dropped code lands in `suppressed` with
//! its reason and every missing fact becomes a documentation gap.

use crate::coding::kb::CodingKb;
use crate::coding::patterns::Laterality;
use crate::coding::{
    CodeBundle, CodeLine, NoteCase, PatientContext, PerformedItem, ProcedureKind, SuppressedCode,
};

/// Moderate sedation under 10 minutes is not separately reportable
const SEDATION_MIN_MINUTES: u32 = 10;

/// Each additional sedation unit covers 15 minutes past the 22-minute mark
const SEDATION_ADDON_THRESHOLD: u32 = 22;
const SEDATION_ADDON_UNIT: u32 = 15;

pub fn code_case(
    case: &NoteCase,
    patient_ctx: Option<&PatientContext>,
    kb: &CodingKb,
) -> CodeBundle {
    let mut bundle = CodeBundle {
        kb_version: kb.version_info().to_string(),
        ..Default::default()
    };
    bundle.warnings.extend(case.warnings.iter().cloned());

    if case.low_confidence {
        return bundle;
    }

    let has = |kind: ProcedureKind| case.items.iter().any(|i| i.kind == kind);

    emit_explicit_cpts(case, kb, &mut bundle);

    for item in &case.items {
        match item.kind {
            ProcedureKind::TrachealStentInsertion => emit_tracheal_stent(item, &mut bundle),
            ProcedureKind::BronchialStentInsertion => emit_bronchial_stent(item, &mut bundle),
            ProcedureKind::AirwayDilationOnly => {
                let stented = has(ProcedureKind::TrachealStentInsertion)
                    || has(ProcedureKind::BronchialStentInsertion);
                emit_dilation(item, stented, &mut bundle);
            }
            ProcedureKind::TumorExcisionBronchoscopic => emit_excision(item, &mut bundle),
            ProcedureKind::TumorDestructionBronchoscopic => {
                let excised = has(ProcedureKind::TumorExcisionBronchoscopic);
                emit_destruction(item, excised, &mut bundle);
            }
            ProcedureKind::WholeLungLavage => {
                push_primary(
                    &mut bundle,
                    CodeLine::new("32997", "whole_lung_lavage", "Whole lung lavage performed")
                        .with_spans(&item.spans),
                );
                if case.laterality == Some(Laterality::Unspecified) {
                    bundle
                        .documentation_gaps
                        .push("Laterality of lung lavage not documented".to_string());
                }
            }
            ProcedureKind::EbusTbna => emit_ebus_tbna(case, item, &mut bundle),
            ProcedureKind::EbusWithoutTbna => {}
            ProcedureKind::TblbForcepsOrCryo => emit_tblb(case, item, &mut bundle),
        }
    }

    // Radial/diagnostic EBUS is an add-on only when no linear sampling code
    // is already present
    if let Some(item) = case
        .items
        .iter()
        .find(|i| i.kind == ProcedureKind::EbusWithoutTbna)
    {
        if !bundle.contains_code("31652") && !bundle.contains_code("31653") {
            bundle.add_on_cpts.push(
                CodeLine::new(
                    "31654",
                    "radial_ebus_addon",
                    "Radial/diagnostic EBUS without transbronchial needle sampling",
                )
                .with_spans(&item.spans),
            );
        }
    }

    emit_sedation(case, patient_ctx, &mut bundle);
    suppress_diagnostic_bronchoscopy(kb, &mut bundle);
    apply_ncci_edits(kb, &mut bundle);
    apply_bilateral(case, kb, &mut bundle);
    emit_device_hcpcs(case, kb, &mut bundle);
    emit_pcs(case, kb, &mut bundle);
    emit_documentation_gaps(case, &mut bundle);
    fill_descriptions(kb, &mut bundle);

    bundle
}

impl CodeLine {
    fn with_spans(mut self, spans: &[String]) -> Self {
        self.spans = spans.to_vec();
        self
    }

    fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
}

fn push_primary(bundle: &mut CodeBundle, line: CodeLine) {
    if !bundle.contains_code(&line.code) {
        bundle.primary_cpts.push(line);
    }
}

fn emit_explicit_cpts(case: &NoteCase, kb: &CodingKb, bundle: &mut CodeBundle) {
    for cpt in &case.explicit_cpts {
        if kb.knows(cpt) {
            push_primary(
                bundle,
                CodeLine::new(
                    cpt.clone(),
                    "explicit_mention",
                    "Explicitly documented in the report",
                )
                .with_spans(&[cpt.clone()]),
            );
        } else {
            bundle.warnings.push(format!(
                "kb_version_mismatch: CPT {} is not in KB {}; dropped",
                cpt,
                kb.version_info()
            ));
        }
    }
}

fn emit_tracheal_stent(item: &PerformedItem, bundle: &mut CodeBundle) {
    let mut rationale = "Tracheal stent placement".to_string();
    if let Some(brand) = item.details.get("brand") {
        rationale.push_str(&format!(" ({})", brand));
    }
    push_primary(
        bundle,
        CodeLine::new("31631", "tracheal_stent", rationale).with_spans(&item.spans),
    );
}

fn emit_bronchial_stent(item: &PerformedItem, bundle: &mut CodeBundle) {
    push_primary(
        bundle,
        CodeLine::new(
            "31636",
            "bronchial_stent",
            "Bronchial stent placement, initial bronchus",
        )
        .with_spans(&item.spans),
    );
    if item.count > 1 {
        bundle.add_on_cpts.push(
            CodeLine::new(
                "31637",
                "bronchial_stent_additional",
                format!("Additional bronchus stented ({} total)", item.count),
            )
            .with_spans(&item.spans)
            .with_quantity(item.count - 1),
        );
    }
}

fn emit_dilation(item: &PerformedItem, stented: bool, bundle: &mut CodeBundle) {
    if stented {
        bundle.suppressed.push(SuppressedCode {
            code: "31630".to_string(),
            reason: "Dilation performed to place a stent is bundled into the stent CPT"
                .to_string(),
        });
        return;
    }
    push_primary(
        bundle,
        CodeLine::new("31630", "airway_dilation", "Airway dilation without stent placement")
            .with_spans(&item.spans),
    );
}

fn emit_excision(item: &PerformedItem, bundle: &mut CodeBundle) {
    let rationale = if item.specimens_collected {
        "Bronchoscopic tumor excision with specimen collection"
    } else {
        "Bronchoscopic tumor excision"
    };
    push_primary(
        bundle,
        CodeLine::new("31640", "tumor_excision", rationale).with_spans(&item.spans),
    );
}

fn emit_destruction(item: &PerformedItem, excised: bool, bundle: &mut CodeBundle) {
    if excised {
        bundle.suppressed.push(SuppressedCode {
            code: "31641".to_string(),
            reason: "Excision takes precedence over destruction at the same site".to_string(),
        });
        return;
    }
    push_primary(
        bundle,
        CodeLine::new("31641", "tumor_destruction", "Bronchoscopic tumor destruction")
            .with_spans(&item.spans),
    );
}

fn emit_ebus_tbna(case: &NoteCase, item: &PerformedItem, bundle: &mut CodeBundle) {
    let stations: Vec<&str> = case.stations.iter().map(String::as_str).collect();

    let line = if stations.len() >= 3 {
        CodeLine::new(
            "31653",
            "ebus_tbna_multi_station",
            format!(
                "EBUS-TBNA sampling of {} unique stations: {}",
                stations.len(),
                stations.join(", ")
            ),
        )
    } else if !stations.is_empty() {
        CodeLine::new(
            "31652",
            "ebus_tbna_single_station",
            format!("EBUS-TBNA sampling of 1-2 stations: {}", stations.join(", ")),
        )
    } else {
        bundle.documentation_gaps.push(
            "List the specific lymph node stations sampled (e.g., 4R, 7, 11L)".to_string(),
        );
        CodeLine::new(
            "31652",
            "ebus_tbna_single_station",
            "EBUS-TBNA performed; stations not specified",
        )
    };

    // Station counting owns 31652/31653; drop any explicit-mention copies
    bundle
        .primary_cpts
        .retain(|l| l.code != "31652" && l.code != "31653");
    push_primary(bundle, line.with_spans(&item.spans));
}

fn emit_tblb(case: &NoteCase, item: &PerformedItem, bundle: &mut CodeBundle) {
    let lobes: Vec<&str> = case.lobes.iter().map(String::as_str).collect();

    if lobes.is_empty() {
        bundle
            .documentation_gaps
            .push("Specify the lobe(s) biopsied for TBLB (e.g., RUL)".to_string());
        push_primary(
            bundle,
            CodeLine::new(
                "31628",
                "tblb_first_lobe",
                "Transbronchial lung biopsy; lobe not specified",
            )
            .with_spans(&item.spans),
        );
        return;
    }

    push_primary(
        bundle,
        CodeLine::new(
            "31628",
            "tblb_first_lobe",
            format!("Transbronchial lung biopsy, first lobe {}", lobes[0]),
        )
        .with_spans(&item.spans),
    );

    if lobes.len() > 1 {
        bundle.add_on_cpts.push(
            CodeLine::new(
                "31632",
                "tblb_additional_lobe",
                format!("Additional lobe(s) biopsied: {}", lobes[1..].join(", ")),
            )
            .with_spans(&item.spans)
            .with_quantity((lobes.len() - 1) as u32),
        );
    }
}

fn emit_sedation(case: &NoteCase, patient_ctx: Option<&PatientContext>, bundle: &mut CodeBundle) {
    let sedation = &case.sedation;

    if sedation.general_anesthesia {
        bundle
            .warnings
            .push("no moderate sedation under GA".to_string());
        if sedation.moderate_sedation_documented {
            bundle.suppressed.push(SuppressedCode {
                code: "99152".to_string(),
                reason: "no moderate sedation under GA".to_string(),
            });
        }
        return;
    }

    if !sedation.moderate_sedation_documented {
        return;
    }

    if !sedation.times_documented {
        bundle
            .documentation_gaps
            .push("Sedation start and stop times not documented".to_string());
    }

    let Some(total) = sedation.total_minutes else {
        return;
    };

    if total < SEDATION_MIN_MINUTES {
        bundle.warnings.push(format!(
            "moderate sedation of {} min is below the {}-minute reporting threshold",
            total, SEDATION_MIN_MINUTES
        ));
        return;
    }

    let under_five = patient_ctx
        .and_then(|ctx| ctx.age_years)
        .is_some_and(|age| age < 5);

    let (initial, additional) = if sedation.separate_provider {
        (if under_five { "99155" } else { "99156" }, "99157")
    } else {
        (if under_five { "99151" } else { "99152" }, "99153")
    };

    push_primary(
        bundle,
        CodeLine::new(
            initial,
            "moderate_sedation_initial",
            format!("Moderate sedation, {} min total; initial 15 min", total),
        ),
    );

    let additional_units = total
        .saturating_sub(SEDATION_ADDON_THRESHOLD)
        .div_ceil(SEDATION_ADDON_UNIT);
    if additional_units > 0 {
        bundle.add_on_cpts.push(
            CodeLine::new(
                additional,
                "moderate_sedation_additional",
                format!("{} additional 15-minute unit(s)", additional_units),
            )
            .with_quantity(additional_units),
        );
    }

    bundle.sedation_family = Some(format!("{}/{}", initial, additional));
}

/// CPT 31622 is bundled whenever any surgical bronchoscopy code is reported
fn suppress_diagnostic_bronchoscopy(kb: &CodingKb, bundle: &mut CodeBundle) {
    if !bundle.contains_code("31622") {
        return;
    }
    let surgical_present = bundle
        .all_codes()
        .iter()
        .any(|line| kb.is_surgical_bronchoscopy(&line.code));
    if surgical_present {
        bundle.primary_cpts.retain(|l| l.code != "31622");
        bundle.suppressed.push(SuppressedCode {
            code: "31622".to_string(),
            reason: "Diagnostic bronchoscopy is bundled into surgical bronchoscopy codes"
                .to_string(),
        });
        bundle.warnings.push(
            "Diagnostic bronchoscopy (31622) suppressed; bundled into other bronchoscopy codes"
                .to_string(),
        );
    }
}

fn apply_ncci_edits(kb: &CodingKb, bundle: &mut CodeBundle) {
    for edit in kb.ncci_edits() {
        if bundle.contains_code(&edit.code) && bundle.contains_code(&edit.bundles_into) {
            bundle.primary_cpts.retain(|l| l.code != edit.code);
            bundle.add_on_cpts.retain(|l| l.code != edit.code);
            let reason = if edit.reason.is_empty() {
                format!("NCCI: {} bundles into {}", edit.code, edit.bundles_into)
            } else {
                format!("NCCI: {}", edit.reason)
            };
            bundle.suppressed.push(SuppressedCode {
                code: edit.code.clone(),
                reason,
            });
        }
    }
}

fn apply_bilateral(case: &NoteCase, kb: &CodingKb, bundle: &mut CodeBundle) {
    if case.laterality != Some(Laterality::Bilateral) {
        return;
    }

    let mut applied = false;
    for line in bundle
        .primary_cpts
        .iter_mut()
        .chain(bundle.add_on_cpts.iter_mut())
    {
        if kb.is_bilateral_eligible(&line.code) && !line.modifiers.iter().any(|m| m == "-50") {
            line.modifiers.push("-50".to_string());
            applied = true;
        }
    }

    if applied {
        if !bundle.modifiers.iter().any(|m| m == "-50") {
            bundle.modifiers.push("-50".to_string());
        }
    } else {
        bundle
            .documentation_gaps
            .push("bilateral evidence without bilateral-eligible code".to_string());
    }
}

fn emit_device_hcpcs(case: &NoteCase, kb: &CodingKb, bundle: &mut CodeBundle) {
    for item in &case.items {
        for code in kb.hcpcs_for(item.kind.id()) {
            if bundle.hcpcs.iter().any(|l| &l.code == code) {
                continue;
            }
            bundle.hcpcs.push(
                CodeLine::new(
                    code.clone(),
                    "device_hcpcs",
                    format!("Device supply for {}", item.kind.id()),
                )
                .with_spans(&item.spans),
            );
        }
    }
}

fn emit_pcs(case: &NoteCase, kb: &CodingKb, bundle: &mut CodeBundle) {
    let suppressed: Vec<&str> = bundle.suppressed.iter().map(|s| s.code.as_str()).collect();

    for item in &case.items {
        // An item whose CPT was suppressed does not crosswalk either
        let cpt = match item.kind {
            ProcedureKind::TrachealStentInsertion => Some("31631"),
            ProcedureKind::BronchialStentInsertion => Some("31636"),
            ProcedureKind::AirwayDilationOnly => Some("31630"),
            ProcedureKind::TumorExcisionBronchoscopic => Some("31640"),
            ProcedureKind::TumorDestructionBronchoscopic => Some("31641"),
            ProcedureKind::WholeLungLavage => Some("32997"),
            ProcedureKind::TblbForcepsOrCryo => Some("31628"),
            ProcedureKind::EbusTbna | ProcedureKind::EbusWithoutTbna => None,
        };
        if cpt.is_some_and(|c| suppressed.contains(&c)) {
            continue;
        }

        if let Some(code) = kb.pcs_for(item.kind.id(), item.site) {
            if !bundle.icd10_pcs.iter().any(|c| c == code) {
                bundle.icd10_pcs.push(code.to_string());
            }
        }
    }
}

fn emit_documentation_gaps(case: &NoteCase, bundle: &mut CodeBundle) {
    let stent = case.items.iter().find(|i| {
        matches!(
            i.kind,
            ProcedureKind::TrachealStentInsertion | ProcedureKind::BronchialStentInsertion
        )
    });
    if let Some(stent) = stent {
        if !stent.details.contains_key("size") {
            bundle
                .documentation_gaps
                .push("Stent size not documented".to_string());
        }
    }

    if case.items.iter().any(|i| i.kind == ProcedureKind::EbusTbna)
        && !case.note_text.to_lowercase().contains("elastography")
    {
        bundle
            .documentation_gaps
            .push("Document elastography use if performed for staging".to_string());
    }
}

fn fill_descriptions(kb: &CodingKb, bundle: &mut CodeBundle) {
    for line in bundle
        .primary_cpts
        .iter_mut()
        .chain(bundle.add_on_cpts.iter_mut())
        .chain(bundle.hcpcs.iter_mut())
    {
        if line.description.is_empty() {
            if let Some(description) = kb.describe(&line.code) {
                line.description = description.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{extract_case, NotePatterns};

    fn run(note: &str) -> CodeBundle {
        let patterns = NotePatterns::new();
        let case = extract_case(note, &patterns);
        code_case(&case, None, &CodingKb::builtin())
    }

    fn run_with_age(note: &str, age: u32) -> CodeBundle {
        let patterns = NotePatterns::new();
        let case = extract_case(note, &patterns);
        code_case(
            &case,
            Some(&PatientContext {
                age_years: Some(age),
            }),
            &CodingKb::builtin(),
        )
    }

    #[test]
    fn test_multistation_ebus_under_ga() {
        let bundle = run(
            "Convex EBUS-TBNA with sampling of stations 4R, 7, and 11L; 22G needle x3 passes \
             each; ROSE adequate. Patient under general anesthesia via ETT.",
        );

        assert!(bundle.contains_code("31653"));
        assert!(!bundle.contains_code("31652"));
        // GA suppresses the moderate-sedation family entirely
        assert!(bundle.sedation_family.is_none());
        for code in ["99151", "99152", "99153", "99155", "99156", "99157"] {
            assert!(!bundle.contains_code(code), "{} must not be emitted", code);
        }
        assert!(bundle
            .warnings
            .iter()
            .any(|w| w.contains("no moderate sedation under GA")));
        assert!(!bundle.kb_version.is_empty());
        assert!(bundle.icd10_pcs.contains(&"07B74ZX".to_string()));
    }

    #[test]
    fn test_single_station_ebus() {
        let bundle = run("EBUS with TBNA of station 7, moderate sedation 25 min with midazolam.");
        assert!(bundle.contains_code("31652"));
        assert!(!bundle.contains_code("31653"));
        assert_eq!(bundle.sedation_family.as_deref(), Some("99152/99153"));
    }

    #[test]
    fn test_dilation_bundled_into_stent() {
        let bundle = run(
            "Balloon dilation of the trachea followed by Ultraflex stent placement, 16 x 40 mm.",
        );
        assert!(bundle.contains_code("31631"));
        assert!(!bundle.contains_code("31630"));
        assert!(bundle
            .suppressed
            .iter()
            .any(|s| s.code == "31630" && s.reason.contains("bundled into the stent")));
        // Device supply code rides along
        assert!(bundle.hcpcs.iter().any(|l| l.code == "C1876"));
    }

    #[test]
    fn test_dilation_alone_codes() {
        let bundle = run("Balloon dilation of the subglottic stenosis to 12 mm.");
        assert!(bundle.contains_code("31630"));
        assert!(bundle.suppressed.is_empty());
    }

    #[test]
    fn test_excision_beats_destruction() {
        let bundle = run(
            "Tumor removed with electrocautery snare, specimen sent. Base treated with argon \
             plasma coagulation.",
        );
        assert!(bundle.contains_code("31640"));
        assert!(!bundle.contains_code("31641"));
        assert!(bundle
            .suppressed
            .iter()
            .any(|s| s.code == "31641" && s.reason.contains("precedence")));
    }

    #[test]
    fn test_destruction_alone() {
        let bundle = run("Endobronchial tumor treated with APC, good hemostasis.");
        assert!(bundle.contains_code("31641"));
        assert!(!bundle.contains_code("31640"));
    }

    #[test]
    fn test_tblb_additional_lobes() {
        let bundle = run(
            "Transbronchial biopsies of the RUL and RLL under moderate sedation, 30 minutes of \
             sedation documented from 08:00 to 08:30.",
        );
        assert!(bundle.contains_code("31628"));
        let addon = bundle
            .add_on_cpts
            .iter()
            .find(|l| l.code == "31632")
            .expect("additional lobe add-on");
        assert_eq!(addon.quantity, 1);
    }

    #[test]
    fn test_31622_suppressed_by_surgical_code() {
        let bundle = run(
            "Diagnostic bronchoscopy performed (31622) followed by transbronchial biopsy of the \
             RUL (31628).",
        );
        assert!(bundle.contains_code("31628"));
        assert!(!bundle.contains_code("31622"));
        assert!(bundle.suppressed.iter().any(|s| s.code == "31622"));
    }

    #[test]
    fn test_31622_alone_survives() {
        let bundle = run("Diagnostic bronchoscopy with cell washings, billed as 31622.");
        assert!(bundle.contains_code("31622"));
    }

    #[test]
    fn test_ncci_edit_drops_tblb_with_multistation_ebus() {
        let bundle = run(
            "EBUS-TBNA of stations 4R, 7, and 11L. Transbronchial biopsies of the RUL were also \
             obtained.",
        );
        assert!(bundle.contains_code("31653"));
        assert!(!bundle.contains_code("31628"));
        assert!(bundle
            .suppressed
            .iter()
            .any(|s| s.code == "31628" && s.reason.starts_with("NCCI")));
    }

    #[test]
    fn test_bilateral_lavage_gets_modifier() {
        let bundle = run("Sequential bilateral lung lavage via double-lumen tube.");
        let wll = bundle
            .primary_cpts
            .iter()
            .find(|l| l.code == "32997")
            .expect("lavage code");
        assert!(wll.modifiers.contains(&"-50".to_string()));
        assert!(bundle.modifiers.contains(&"-50".to_string()));
    }

    #[test]
    fn test_bilateral_without_eligible_code_warns() {
        let bundle = run("Bilateral disease noted; EBUS-TBNA of stations 4R and 4L performed.");
        assert!(bundle
            .documentation_gaps
            .iter()
            .any(|g| g.contains("bilateral evidence without bilateral-eligible code")));
    }

    #[test]
    fn test_sedation_under_five() {
        let bundle = run_with_age(
            "Flexible bronchoscopy with TBLB of the RUL. Moderate sedation with midazolam for \
             20 min, 09:00 to 09:20.",
            3,
        );
        assert!(bundle.contains_code("99151"));
        assert_eq!(bundle.sedation_family.as_deref(), Some("99151/99153"));
    }

    #[test]
    fn test_sedation_below_threshold_not_reported() {
        let bundle = run(
            "TBLB of the RUL. Moderate sedation with fentanyl for 8 min, 09:00 to 09:08.",
        );
        assert!(bundle.sedation_family.is_none());
        assert!(bundle
            .warnings
            .iter()
            .any(|w| w.contains("below the 10-minute reporting threshold")));
    }

    #[test]
    fn test_sedation_additional_units() {
        let bundle = run(
            "TBLB of the RUL. Moderate sedation with midazolam, 52 minutes of sedation, from \
             09:00 to 09:52.",
        );
        let addon = bundle
            .add_on_cpts
            .iter()
            .find(|l| l.code == "99153")
            .expect("additional sedation units");
        assert_eq!(addon.quantity, 2);
    }

    #[test]
    fn test_low_confidence_returns_empty_bundle() {
        let filler =
            "The patient was brought to the suite and monitored throughout without incident. "
                .repeat(10);
        let bundle = run(&filler);
        assert!(bundle.primary_cpts.is_empty());
        assert!(bundle
            .warnings
            .iter()
            .any(|w| w.contains("manual coding required")));
        assert!(!bundle.kb_version.is_empty());
    }

    #[test]
    fn test_unknown_explicit_cpt_warns_mismatch() {
        let bundle = run("Procedure billed as 99999 per prior note. TBLB of the RUL performed.");
        assert!(!bundle.contains_code("99999"));
        assert!(bundle
            .warnings
            .iter()
            .any(|w| w.starts_with("kb_version_mismatch")));
    }

    #[test]
    fn test_stent_size_gap() {
        let bundle = run("An AERO stent was placed in the left mainstem bronchus.");
        assert!(bundle.contains_code("31636"));
        assert!(bundle
            .documentation_gaps
            .iter()
            .any(|g| g.contains("Stent size")));
    }
}
