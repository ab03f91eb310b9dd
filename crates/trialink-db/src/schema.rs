//! Relational layout of a [`TrialRecord`].
//!
//! One record decomposes into one `studies` row keyed by registry id plus
//! the ordered `endpoints` and `baseline_measures` rows it owns. Child rows
//! are keyed by `(nct_id, position)` so they belong to exactly one study.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use trialink_common::TrialRecord;

use crate::error::Result;

pub const TABLE_STUDIES: &str = "studies";
pub const TABLE_ENDPOINTS: &str = "endpoints";
pub const TABLE_BASELINE_MEASURES: &str = "baseline_measures";

pub const CREATE_STUDIES: &str = "
CREATE TABLE IF NOT EXISTS studies (
    nct_id                 TEXT PRIMARY KEY,
    title                  TEXT NOT NULL,
    sponsor_name           TEXT NOT NULL,
    sponsor_class          TEXT NOT NULL,
    condition              TEXT,
    start_date             TEXT,
    study_type             TEXT NOT NULL,
    phase                  TEXT,
    interventions          TEXT NOT NULL,
    is_public              INTEGER NOT NULL,
    verification_status    TEXT NOT NULL,
    evidence               TEXT NOT NULL,
    verified_at            TEXT NOT NULL,
    drug_name              TEXT,
    dose                   TEXT,
    frequency              TEXT,
    formulation            TEXT,
    validation_status      TEXT NOT NULL,
    provenance             TEXT NOT NULL,
    publication_source     TEXT,
    publication_id         TEXT,
    publication_title      TEXT,
    publication_rationale  TEXT,
    publication_confidence TEXT,
    review_flags           TEXT NOT NULL,
    unresolved_fields      TEXT NOT NULL,
    record_json            TEXT NOT NULL,
    updated_at             TEXT NOT NULL
)";

pub const CREATE_ENDPOINTS: &str = "
CREATE TABLE IF NOT EXISTS endpoints (
    nct_id         TEXT NOT NULL REFERENCES studies(nct_id) ON DELETE CASCADE,
    position       INTEGER NOT NULL,
    name           TEXT NOT NULL,
    description    TEXT,
    timepoint      TEXT,
    arm            TEXT NOT NULL,
    average        REAL,
    upper          REAL,
    lower          REAL,
    is_significant INTEGER,
    PRIMARY KEY (nct_id, position)
)";

pub const CREATE_BASELINE_MEASURES: &str = "
CREATE TABLE IF NOT EXISTS baseline_measures (
    nct_id      TEXT NOT NULL REFERENCES studies(nct_id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    arm         TEXT NOT NULL,
    average     REAL,
    upper       REAL,
    lower       REAL,
    PRIMARY KEY (nct_id, position)
)";

/// `studies` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRow {
    pub nct_id: String,
    pub title: String,
    pub sponsor_name: String,
    pub sponsor_class: String,
    pub condition: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub study_type: String,
    pub phase: Option<String>,
    /// JSON array.
    pub interventions: String,
    pub is_public: bool,
    pub verification_status: String,
    /// JSON array of accession ids.
    pub evidence: String,
    pub verified_at: DateTime<Utc>,
    pub drug_name: Option<String>,
    pub dose: Option<String>,
    pub frequency: Option<String>,
    pub formulation: Option<String>,
    pub validation_status: String,
    /// JSON array of mention window ids.
    pub provenance: String,
    pub publication_source: Option<String>,
    pub publication_id: Option<String>,
    pub publication_title: Option<String>,
    pub publication_rationale: Option<String>,
    pub publication_confidence: Option<String>,
    /// JSON array.
    pub review_flags: String,
    /// JSON array.
    pub unresolved_fields: String,
    /// The full record, for lossless reads.
    pub record_json: String,
}

/// `endpoints` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRow {
    pub nct_id: String,
    pub position: i64,
    pub name: String,
    pub description: Option<String>,
    pub timepoint: Option<String>,
    pub arm: String,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
    pub is_significant: Option<bool>,
}

/// `baseline_measures` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRow {
    pub nct_id: String,
    pub position: i64,
    pub name: String,
    pub description: Option<String>,
    pub arm: String,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
}

fn json_label<T: Serialize>(v: &T) -> Result<String> {
    let value = serde_json::to_value(v)?;
    Ok(value.as_str().map(String::from).unwrap_or_else(|| value.to_string()))
}

/// Splits a record into its three relations.
pub fn decompose(record: &TrialRecord) -> Result<(StudyRow, Vec<EndpointRow>, Vec<BaselineRow>)> {
    let trial = &record.trial;
    let nct_id = trial.registry_id.clone();
    let publication = record.publication.as_ref();

    let study = StudyRow {
        nct_id: nct_id.clone(),
        title: trial.title.clone(),
        sponsor_name: trial.sponsor_name.clone(),
        sponsor_class: trial.sponsor_class.as_str().to_string(),
        condition: trial.condition.clone(),
        start_date: trial.start_date,
        study_type: trial.study_type.clone(),
        phase: trial.phase.clone(),
        interventions: serde_json::to_string(&trial.interventions)?,
        is_public: record.sponsor.is_public,
        verification_status: json_label(&record.sponsor.status)?,
        evidence: serde_json::to_string(&record.sponsor.evidence)?,
        verified_at: record.sponsor.verified_at,
        drug_name: record.metadata.drug_name.clone(),
        dose: record.metadata.dose.clone(),
        frequency: record.metadata.frequency.clone(),
        formulation: record.metadata.formulation.clone(),
        validation_status: record.metadata.validation_status.as_str().to_string(),
        provenance: serde_json::to_string(&record.metadata.provenance)?,
        publication_source: publication.map(|p| p.candidate_source.as_str().to_string()),
        publication_id: publication.map(|p| p.candidate_id.clone()),
        publication_title: publication.map(|p| p.candidate_title.clone()),
        publication_rationale: publication.map(|p| p.rationale.clone()),
        publication_confidence: publication.map(|p| json_label(&p.confidence)).transpose()?,
        review_flags: serde_json::to_string(&record.review_flags)?,
        unresolved_fields: serde_json::to_string(&record.unresolved_fields)?,
        record_json: serde_json::to_string(record)?,
    };

    let endpoints = record.metadata.endpoints.iter().enumerate().map(|(i, e)| EndpointRow {
        nct_id: nct_id.clone(),
        position: i as i64,
        name: e.name.clone(),
        description: e.description.clone(),
        timepoint: e.timepoint.clone(),
        arm: e.arm.as_str().to_string(),
        average: e.average,
        upper: e.upper,
        lower: e.lower,
        is_significant: e.is_significant,
    }).collect();

    let baselines = record.metadata.baseline_measures.iter().enumerate().map(|(i, b)| BaselineRow {
        nct_id: nct_id.clone(),
        position: i as i64,
        name: b.name.clone(),
        description: b.description.clone(),
        arm: b.arm.as_str().to_string(),
        average: b.average,
        upper: b.upper,
        lower: b.lower,
    }).collect();

    Ok((study, endpoints, baselines))
}
