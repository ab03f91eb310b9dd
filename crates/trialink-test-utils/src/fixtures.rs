use chrono::NaiveDate;

use trialink_common::{
    FilingRef, FormType, PublicationCandidate, PublicationSource, SponsorClass, TrialStub,
};

/// Industry-sponsored interventional trial.
pub fn trial_stub(registry_id: &str, sponsor_name: &str, title: &str) -> TrialStub {
    trial_stub_with(registry_id, sponsor_name, title, SponsorClass::Industry, &[])
}

pub fn trial_stub_with(
    registry_id: &str,
    sponsor_name: &str,
    title: &str,
    sponsor_class: SponsorClass,
    interventions: &[&str],
) -> TrialStub {
    TrialStub {
        registry_id: registry_id.to_string(),
        title: title.to_string(),
        sponsor_name: sponsor_name.to_string(),
        condition: Some("Obesity".to_string()),
        start_date: NaiveDate::from_ymd_opt(2021, 3, 1),
        study_type: "INTERVENTIONAL".to_string(),
        sponsor_class,
        phase: Some("PHASE3".to_string()),
        interventions: interventions.iter().map(|s| s.to_string()).collect(),
    }
}

/// Annual report with a deterministic archive URL.
pub fn filing(accession_id: &str, filed: (i32, u32, u32)) -> FilingRef {
    FilingRef {
        accession_id: accession_id.to_string(),
        form_type: FormType::TenK,
        filed_at: NaiveDate::from_ymd_opt(filed.0, filed.1, filed.2),
        source_url: format!("https://www.sec.gov/Archives/edgar/data/1/{accession_id}/10k.htm"),
        cik: Some("0000000001".to_string()),
        filer_name: None,
    }
}

pub fn candidate(source: PublicationSource, external_id: &str, title: &str, rank: usize) -> PublicationCandidate {
    PublicationCandidate {
        source,
        external_id: external_id.to_string(),
        title: title.to_string(),
        abstract_text: Some(format!("Abstract of {title}.")),
        rank,
        doi: None,
        year: Some(2023),
    }
}

/// Judge reply in the shape the matcher's schema asks for.
pub fn judgment_json(verdict: &str, confidence: &str) -> String {
    serde_json::json!({
        "verdict": verdict,
        "confidence": confidence,
        "rationale": format!("scripted {verdict}"),
    })
    .to_string()
}
