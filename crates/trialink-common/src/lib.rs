//! trialink-common — Shared data model, errors and the allowlisted HTTP client
//! used across all trialink crates.

pub mod error;
pub mod entities;
pub mod sandbox;

pub use entities::{
    Arm, BaselineMeasure, Endpoint, EnrichedMetadata, FilingRef, FormType, KeywordClass,
    MatchConfidence, MatchDecision, MatchVerdict, MentionWindow, PublicationCandidate,
    PublicationSource, ReviewFlag, SponsorClass, SponsorVerdict, TrialRecord, TrialStub,
    ValidationStatus, VerificationStatus,
};
pub use error::{Result, TrialinkError};
