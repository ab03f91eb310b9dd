/// Core entity types for a single resolution run.
/// These mirror the JSON output document and the three persisted relations
/// (studies, endpoints, baseline_measures).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry classification of the lead sponsor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SponsorClass {
    Industry,
    Nih,
    OtherGov,
    Network,
    Other,
    Unknown,
}

impl SponsorClass {
    /// Parse the registry's `leadSponsor.class` value.
    pub fn from_registry(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INDUSTRY"  => SponsorClass::Industry,
            "NIH"       => SponsorClass::Nih,
            "OTHER_GOV" | "FED" => SponsorClass::OtherGov,
            "NETWORK"   => SponsorClass::Network,
            "OTHER" | "INDIV" => SponsorClass::Other,
            _           => SponsorClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SponsorClass::Industry => "industry",
            SponsorClass::Nih      => "nih",
            SponsorClass::OtherGov => "other_gov",
            SponsorClass::Network  => "network",
            SponsorClass::Other    => "other",
            SponsorClass::Unknown  => "unknown",
        }
    }
}

/// A trial as fetched from the registry. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialStub {
    pub registry_id: String,  // e.g. NCT05036135
    pub title: String,
    pub sponsor_name: String,
    pub condition: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub study_type: String,
    pub sponsor_class: SponsorClass,
    pub phase: Option<String>,
    pub interventions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Sponsor verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// The filing search answered; `is_public` reflects its result.
    Verified,
    /// The filing search failed; `is_public` is the conservative default.
    Unverified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SponsorVerdict {
    pub sponsor_name: String,
    pub is_public: bool,
    pub status: VerificationStatus,
    /// Accession ids of the filings that support the verdict.
    pub evidence: Vec<String>,
    pub verified_at: DateTime<Utc>,
}

impl SponsorVerdict {
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

// ---------------------------------------------------------------------------
// Filings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FormType {
    #[serde(rename = "10-K")]
    TenK,
    #[serde(rename = "8-K")]
    EightK,
    #[serde(rename = "other")]
    Other,
}

impl FormType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "10-K" | "10-K405" | "10-KT" => FormType::TenK,
            "8-K" => FormType::EightK,
            _ => FormType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::TenK   => "10-K",
            FormType::EightK => "8-K",
            FormType::Other  => "other",
        }
    }
}

/// A filing located by the filing search. Raw content is fetched lazily by
/// the content client and never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilingRef {
    pub accession_id: String,
    pub form_type: FormType,
    pub filed_at: Option<NaiveDate>,
    pub source_url: String,
    pub cik: Option<String>,
    pub filer_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Mentions
// ---------------------------------------------------------------------------

/// Keyword class that produced a mention window, in priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeywordClass {
    NctId,
    TitleFragment,
    DrugName,
}

impl KeywordClass {
    pub const PRIORITY: [KeywordClass; 3] =
        [KeywordClass::NctId, KeywordClass::TitleFragment, KeywordClass::DrugName];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordClass::NctId         => "nct_id",
            KeywordClass::TitleFragment => "title_fragment",
            KeywordClass::DrugName      => "drug_name",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MentionWindow {
    pub id: String,
    pub filing_id: String,
    pub trial_id: String,
    pub keyword_class: KeywordClass,
    /// Byte offsets into the normalized filing text, end exclusive.
    pub span: (usize, usize),
    pub text: String,
    pub context_before: String,
    pub context_after: String,
}

// ---------------------------------------------------------------------------
// Enriched metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Intervention,
    Placebo,
    Other,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Intervention => "intervention",
            Arm::Placebo      => "placebo",
            Arm::Other        => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub name: String,
    pub description: Option<String>,
    pub timepoint: Option<String>,
    pub arm: Arm,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
    pub is_significant: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineMeasure {
    pub name: String,
    pub description: Option<String>,
    pub arm: Arm,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Repaired,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Valid    => "valid",
            ValidationStatus::Repaired => "repaired",
            ValidationStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedMetadata {
    pub trial_id: String,
    pub drug_name: Option<String>,
    pub dose: Option<String>,
    pub frequency: Option<String>,
    pub formulation: Option<String>,
    pub endpoints: Vec<Endpoint>,
    pub baseline_measures: Vec<BaselineMeasure>,
    /// MentionWindow ids used as evidence.
    pub provenance: Vec<String>,
    pub validation_status: ValidationStatus,
}

impl EnrichedMetadata {
    /// All-null metadata with no evidence behind it.
    pub fn empty(trial_id: impl Into<String>) -> Self {
        Self {
            trial_id: trial_id.into(),
            drug_name: None,
            dose: None,
            frequency: None,
            formulation: None,
            endpoints: Vec::new(),
            baseline_measures: Vec::new(),
            provenance: Vec::new(),
            validation_status: ValidationStatus::Valid,
        }
    }

    /// All-null metadata for a field set that failed validation. The
    /// provenance is kept so a reviewer can see what the model was shown.
    pub fn rejected(trial_id: impl Into<String>, provenance: Vec<String>) -> Self {
        Self {
            provenance,
            validation_status: ValidationStatus::Rejected,
            ..Self::empty(trial_id)
        }
    }

    /// Names of the drug fields left null.
    pub fn unresolved_fields(&self) -> Vec<String> {
        [
            ("drug_name", &self.drug_name),
            ("dose", &self.dose),
            ("frequency", &self.frequency),
            ("formulation", &self.formulation),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k.to_string())
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Publications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PublicationSource {
    #[serde(rename = "crossref")]
    CrossRef,
    #[serde(rename = "pubmed")]
    PubMed,
    SemanticScholar,
    #[serde(rename = "openalex")]
    OpenAlex,
}

impl PublicationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationSource::CrossRef        => "crossref",
            PublicationSource::PubMed          => "pubmed",
            PublicationSource::SemanticScholar => "semantic_scholar",
            PublicationSource::OpenAlex        => "openalex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "crossref"                          => Some(PublicationSource::CrossRef),
            "pubmed"                            => Some(PublicationSource::PubMed),
            "semantic_scholar" | "semanticscholar" => Some(PublicationSource::SemanticScholar),
            "openalex"                          => Some(PublicationSource::OpenAlex),
            _                                   => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationCandidate {
    pub source: PublicationSource,
    pub external_id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    /// 1-based rank within its source's result list.
    pub rank: usize,
    pub doi: Option<String>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchVerdict {
    Match,
    NoMatch,
    Uncertain,
}

/// Categorical confidence reported by the judge; not a calibrated score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchDecision {
    pub trial_id: String,
    pub candidate_source: PublicationSource,
    pub candidate_id: String,
    pub candidate_title: String,
    pub verdict: MatchVerdict,
    pub rationale: String,
    pub confidence: MatchConfidence,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Why a record needs a human look.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    /// No filing text mentioned the trial.
    NoMentions,
    /// Some filings could not be fetched.
    FilingsDegraded,
    /// The metadata field set was rejected by validation.
    MetadataRejected,
    /// The metadata needed a repair round.
    MetadataRepaired,
    /// One or more publication sources failed.
    PublicationSourcesDegraded,
    /// One or more candidate judgments could not be obtained.
    JudgmentsDegraded,
    /// No candidate was judged a match.
    NoPublicationMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub trial: TrialStub,
    pub sponsor: SponsorVerdict,
    pub metadata: EnrichedMetadata,
    pub publication: Option<MatchDecision>,
    pub review_flags: Vec<ReviewFlag>,
    pub unresolved_fields: Vec<String>,
}

impl TrialRecord {
    pub fn registry_id(&self) -> &str {
        &self.trial.registry_id
    }

    pub fn needs_review(&self) -> bool {
        self.review_flags.iter().any(|f| {
            matches!(f, ReviewFlag::MetadataRejected | ReviewFlag::FilingsDegraded)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_type_parse() {
        assert_eq!(FormType::parse("10-K"), FormType::TenK);
        assert_eq!(FormType::parse(" 8-k "), FormType::EightK);
        assert_eq!(FormType::parse("S-1"), FormType::Other);
        assert_eq!(serde_json::to_string(&FormType::TenK).unwrap(), "\"10-K\"");
    }

    #[test]
    fn test_sponsor_class_from_registry() {
        assert_eq!(SponsorClass::from_registry("INDUSTRY"), SponsorClass::Industry);
        assert_eq!(SponsorClass::from_registry("OTHER_GOV"), SponsorClass::OtherGov);
        assert_eq!(SponsorClass::from_registry("???"), SponsorClass::Unknown);
    }

    #[test]
    fn test_keyword_class_priority_order() {
        let mut classes = vec![KeywordClass::DrugName, KeywordClass::NctId, KeywordClass::TitleFragment];
        classes.sort();
        assert_eq!(classes, KeywordClass::PRIORITY.to_vec());
    }

    #[test]
    fn test_unresolved_fields_lists_nulls() {
        let mut m = EnrichedMetadata::empty("NCT00000001");
        m.drug_name = Some("Imatinib".to_string());
        assert_eq!(m.unresolved_fields(), vec!["dose", "frequency", "formulation"]);
    }

    #[test]
    fn test_rejected_keeps_provenance_and_nulls() {
        let m = EnrichedMetadata::rejected("NCT00000001", vec!["w1".to_string()]);
        assert_eq!(m.validation_status, ValidationStatus::Rejected);
        assert_eq!(m.provenance, vec!["w1"]);
        assert!(m.drug_name.is_none() && m.endpoints.is_empty());
    }

    #[test]
    fn test_publication_source_parse() {
        assert_eq!(PublicationSource::parse("Semantic Scholar"), Some(PublicationSource::SemanticScholar));
        assert_eq!(PublicationSource::parse("openalex"), Some(PublicationSource::OpenAlex));
        assert_eq!(PublicationSource::parse("europepmc"), None);
    }

    #[test]
    fn test_null_fields_are_serialized_not_omitted() {
        let json = serde_json::to_value(EnrichedMetadata::empty("NCT1")).unwrap();
        assert!(json.get("drug_name").unwrap().is_null());
        assert!(json.get("endpoints").unwrap().as_array().unwrap().is_empty());
    }
}
