//! Metadata enrichment against a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use trialink_common::{MentionWindow, SponsorClass, TrialStub, ValidationStatus};
use trialink_ingestion::caller::RetryPolicy;
use trialink_ingestion::{EnricherConfig, MentionExtractor, MetadataEnricher, RunContext};
use trialink_llm::CallPurpose;
use trialink_test_utils::{filing, trial_stub_with, ScriptedLlm};

const FILING_TEXT: &str = "Our Phase 3 trial NCT05036135 evaluates Imatinib 400 mg once daily in adults. \
Median baseline age was 54 years.";

const VALID: &str = r#"{"drug_name": "Imatinib", "dose": "400 mg", "frequency": "once daily",
    "formulation": null, "endpoints": [], "baseline_measures": [
    {"name": "Age", "description": "years", "arm": "intervention", "average": 54, "upper": null, "lower": null}]}"#;

/// Average above upper bound: fails validation.
const OUT_OF_BOUNDS: &str = r#"{"drug_name": "Imatinib", "dose": null, "frequency": null,
    "formulation": null, "endpoints": [
    {"name": "Response", "description": null, "timepoint": null, "arm": "intervention",
     "average": 80, "upper": 60, "lower": 40, "is_significant": null}], "baseline_measures": []}"#;

fn ctx() -> RunContext {
    RunContext::new(RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_transient_attempts: 1,
        jitter: Duration::ZERO,
        requests_per_second: None,
        ..Default::default()
    })
}

fn trial() -> TrialStub {
    trial_stub_with(
        "NCT05036135",
        "Acme Biotech",
        "A Study of Imatinib in Adults With Chronic Myeloid Leukemia",
        SponsorClass::Industry,
        &["Imatinib"],
    )
}

fn windows(text: &str) -> Vec<MentionWindow> {
    let f = filing("0001", (2024, 2, 1));
    MentionExtractor::default().extract(&f, text, &trial()).collect()
}

/// Replies with `replies[i]` on the i-th call, repeating the last one.
fn sequence(replies: Vec<&'static str>) -> ScriptedLlm {
    let n = AtomicUsize::new(0);
    ScriptedLlm::new(move |_| {
        let i = n.fetch_add(1, Ordering::SeqCst).min(replies.len() - 1);
        Ok(replies[i].to_string())
    })
}

#[tokio::test]
async fn test_enrich_single_nct_window() {
    let windows = windows(FILING_TEXT);
    assert_eq!(windows.len(), 1);

    let llm = Arc::new(sequence(vec![VALID]));
    let enricher = MetadataEnricher::new(llm.clone(), EnricherConfig::default());
    let ctx = ctx();
    let meta = enricher.enrich(&ctx, &trial(), &windows).await;

    assert_eq!(meta.drug_name.as_deref(), Some("Imatinib"));
    assert_eq!(meta.dose.as_deref(), Some("400 mg"));
    assert_eq!(meta.frequency.as_deref(), Some("once daily"));
    assert_eq!(meta.baseline_measures[0].average, Some(54.0));
    assert_eq!(meta.validation_status, ValidationStatus::Valid);
    assert_eq!(meta.provenance, vec![windows[0].id.clone()]);

    let audit = ctx.audit_entries().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].purpose, CallPurpose::Enrichment);
    assert_eq!(audit[0].trial_id, "NCT05036135");
}

#[tokio::test]
async fn test_no_windows_means_no_call() {
    let llm = Arc::new(sequence(vec![VALID]));
    let enricher = MetadataEnricher::new(llm.clone(), EnricherConfig::default());
    let meta = enricher.enrich(&ctx(), &trial(), &[]).await;

    assert_eq!(llm.calls(), 0);
    assert_eq!(meta.drug_name, None);
    assert!(meta.provenance.is_empty());
}

#[tokio::test]
async fn test_invalid_output_gets_one_repair_round() {
    let llm = Arc::new(sequence(vec![OUT_OF_BOUNDS, VALID]));
    let enricher = MetadataEnricher::new(llm.clone(), EnricherConfig::default());
    let ctx = ctx();
    let meta = enricher.enrich(&ctx, &trial(), &windows(FILING_TEXT)).await;

    assert_eq!(meta.validation_status, ValidationStatus::Repaired);
    assert_eq!(meta.drug_name.as_deref(), Some("Imatinib"));
    assert_eq!(llm.calls(), 2);

    // The repair request carries the previous answer and the error.
    let repair = &llm.requests()[1];
    assert_eq!(repair.messages.len(), 4);
    assert!(repair.messages[3].content.contains("lower <= average <= upper"));
    let purposes: Vec<_> = ctx.audit_entries().await.iter().map(|e| e.purpose).collect();
    assert_eq!(purposes, vec![CallPurpose::Enrichment, CallPurpose::EnrichmentRepair]);
}

#[tokio::test]
async fn test_still_invalid_after_repair_is_rejected() {
    let llm = Arc::new(sequence(vec!["not json at all", OUT_OF_BOUNDS, VALID]));
    let enricher = MetadataEnricher::new(llm.clone(), EnricherConfig::default());
    let windows = windows(FILING_TEXT);
    let meta = enricher.enrich(&ctx(), &trial(), &windows).await;

    assert_eq!(meta.validation_status, ValidationStatus::Rejected);
    assert_eq!(meta.drug_name, None);
    assert!(meta.endpoints.is_empty());
    assert_eq!(meta.provenance.len(), windows.len());
    assert_eq!(llm.calls(), 2, "only one repair round");
}

#[tokio::test]
async fn test_model_failure_is_rejected_not_fatal() {
    let llm = Arc::new(ScriptedLlm::failing(400));
    let enricher = MetadataEnricher::new(llm.clone(), EnricherConfig::default());
    let meta = enricher.enrich(&ctx(), &trial(), &windows(FILING_TEXT)).await;

    assert_eq!(meta.validation_status, ValidationStatus::Rejected);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_values_missing_from_evidence_are_nulled() {
    let invented = r#"{"drug_name": "Imatinib", "dose": "800 mg", "frequency": "twice daily",
        "formulation": "tablet", "endpoints": [], "baseline_measures": [
        {"name": "Age", "description": null, "arm": "placebo", "average": 61, "upper": null, "lower": null}]}"#;
    let llm = Arc::new(ScriptedLlm::new(move |_| Ok(invented.to_string())));
    let enricher = MetadataEnricher::new(llm, EnricherConfig::default());
    let meta = enricher.enrich(&ctx(), &trial(), &windows(FILING_TEXT)).await;

    assert_eq!(meta.drug_name.as_deref(), Some("Imatinib"));
    assert_eq!(meta.dose, None);
    assert_eq!(meta.frequency, None);
    assert_eq!(meta.formulation, None);
    assert_eq!(meta.baseline_measures[0].name, "Age");
    assert_eq!(meta.baseline_measures[0].average, None);
    assert_eq!(meta.unresolved_fields(), vec!["dose", "frequency", "formulation"]);
}
