//! Merge of the per-trial branch outputs into one [`TrialRecord`].

use trialink_common::{
    EnrichedMetadata, ReviewFlag, SponsorClass, SponsorVerdict, TrialRecord, TrialStub,
    ValidationStatus,
};

use crate::matcher::MatchOutcome;

/// Gating policy: only industry-sponsored trials whose sponsor was verified
/// as a public filer continue past verification.
pub fn is_eligible(stub: &TrialStub, verdict: &SponsorVerdict) -> bool {
    exclusion_reason(stub, verdict).is_none()
}

/// Why [`is_eligible`] said no, for the run report.
pub fn exclusion_reason(stub: &TrialStub, verdict: &SponsorVerdict) -> Option<String> {
    class_exclusion(stub).or_else(|| verdict_exclusion(verdict))
}

/// The half of the policy that needs no filing search.
pub fn class_exclusion(stub: &TrialStub) -> Option<String> {
    (stub.sponsor_class != SponsorClass::Industry)
        .then(|| format!("sponsor class is {}", stub.sponsor_class.as_str()))
}

fn verdict_exclusion(verdict: &SponsorVerdict) -> Option<String> {
    if !verdict.is_verified() {
        Some("sponsor could not be verified".to_string())
    } else if !verdict.is_public {
        Some("no annual or current report filed under sponsor name".to_string())
    } else {
        None
    }
}

/// Evidence-gathering facts the record flags are derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvidenceSummary {
    pub filings_searched: usize,
    pub filings_failed: usize,
    pub windows: usize,
}

/// Pure assembly; no I/O. Rejected metadata is kept and flagged.
pub fn assemble(
    trial: TrialStub,
    verdict: SponsorVerdict,
    metadata: EnrichedMetadata,
    outcome: &MatchOutcome,
    evidence: EvidenceSummary,
) -> TrialRecord {
    let mut flags = Vec::new();

    if evidence.windows == 0 {
        flags.push(ReviewFlag::NoMentions);
    }
    if evidence.filings_failed > 0 {
        flags.push(ReviewFlag::FilingsDegraded);
    }
    match metadata.validation_status {
        ValidationStatus::Rejected => flags.push(ReviewFlag::MetadataRejected),
        ValidationStatus::Repaired => flags.push(ReviewFlag::MetadataRepaired),
        ValidationStatus::Valid => {}
    }
    if !outcome.degraded_sources.is_empty() {
        flags.push(ReviewFlag::PublicationSourcesDegraded);
    }
    if outcome.failed_judgments > 0 {
        flags.push(ReviewFlag::JudgmentsDegraded);
    }
    if outcome.accepted.is_none() {
        flags.push(ReviewFlag::NoPublicationMatch);
    }
    flags.sort();

    let unresolved_fields = metadata.unresolved_fields();
    TrialRecord {
        trial,
        sponsor: verdict,
        metadata,
        publication: outcome.accepted.clone(),
        review_flags: flags,
        unresolved_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use trialink_common::{MatchConfidence, MatchDecision, MatchVerdict, PublicationSource, VerificationStatus};

    fn stub(class: SponsorClass) -> TrialStub {
        TrialStub {
            registry_id: "NCT05036135".into(),
            title: "Imatinib in Adults".into(),
            sponsor_name: "Acme Biotech".into(),
            condition: None,
            start_date: None,
            study_type: "INTERVENTIONAL".into(),
            sponsor_class: class,
            phase: None,
            interventions: vec![],
        }
    }

    fn verdict(status: VerificationStatus, is_public: bool) -> SponsorVerdict {
        SponsorVerdict {
            sponsor_name: "Acme Biotech".into(),
            is_public,
            status,
            evidence: vec![],
            verified_at: Utc::now(),
        }
    }

    #[test]
    fn test_eligibility() {
        let public = verdict(VerificationStatus::Verified, true);
        assert!(is_eligible(&stub(SponsorClass::Industry), &public));
        assert!(!is_eligible(&stub(SponsorClass::Nih), &public));
        assert!(!is_eligible(&stub(SponsorClass::Industry), &verdict(VerificationStatus::Verified, false)));
        assert!(!is_eligible(&stub(SponsorClass::Industry), &verdict(VerificationStatus::Unverified, false)));
        assert_eq!(exclusion_reason(&stub(SponsorClass::Industry), &public), None);
        assert_eq!(
            exclusion_reason(&stub(SponsorClass::Network), &public).as_deref(),
            Some("sponsor class is network")
        );
        // Class is reported ahead of the verdict and decides without one.
        assert_eq!(
            exclusion_reason(&stub(SponsorClass::Nih), &verdict(VerificationStatus::Unverified, false)).as_deref(),
            Some("sponsor class is nih")
        );
        assert_eq!(class_exclusion(&stub(SponsorClass::Industry)), None);
        assert_eq!(
            exclusion_reason(&stub(SponsorClass::Industry), &verdict(VerificationStatus::Unverified, false)).as_deref(),
            Some("sponsor could not be verified")
        );
    }

    #[test]
    fn test_assemble_flags_degraded_branches() {
        let outcome = MatchOutcome {
            degraded_sources: vec![PublicationSource::SemanticScholar],
            failed_judgments: 1,
            ..Default::default()
        };
        let record = assemble(
            stub(SponsorClass::Industry),
            verdict(VerificationStatus::Verified, true),
            EnrichedMetadata::rejected("NCT05036135", vec!["w1".into()]),
            &outcome,
            EvidenceSummary { filings_searched: 2, filings_failed: 1, windows: 1 },
        );
        assert_eq!(
            record.review_flags,
            vec![
                ReviewFlag::FilingsDegraded,
                ReviewFlag::MetadataRejected,
                ReviewFlag::PublicationSourcesDegraded,
                ReviewFlag::JudgmentsDegraded,
                ReviewFlag::NoPublicationMatch,
            ]
        );
        assert!(record.needs_review());
        assert_eq!(record.unresolved_fields, vec!["drug_name", "dose", "frequency", "formulation"]);
    }

    #[test]
    fn test_assemble_carries_accepted_match() {
        let accepted = MatchDecision {
            trial_id: "NCT05036135".into(),
            candidate_source: PublicationSource::PubMed,
            candidate_id: "1".into(),
            candidate_title: "t".into(),
            verdict: MatchVerdict::Match,
            rationale: "same trial".into(),
            confidence: MatchConfidence::High,
        };
        let outcome = MatchOutcome { accepted: Some(accepted.clone()), ..Default::default() };
        let record = assemble(
            stub(SponsorClass::Industry),
            verdict(VerificationStatus::Verified, true),
            EnrichedMetadata::empty("NCT05036135"),
            &outcome,
            EvidenceSummary::default(),
        );
        assert_eq!(record.publication, Some(accepted));
        assert_eq!(record.review_flags, vec![ReviewFlag::NoMentions]);
    }
}
