//! Record stores.
//!
//! Every store is keyed by registry id and upserts: writing the same record
//! twice leaves exactly the state of writing it once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use trialink_common::TrialRecord;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::schema::decompose;

/// Destination for assembled records.
#[async_trait]
pub trait TrialStore: Send + Sync {
    /// Short label for logs and run reports.
    fn name(&self) -> &'static str;

    async fn upsert(&self, record: &TrialRecord) -> Result<()>;
}

// ── SQLite ───────────────────────────────────────────────────────────────────

/// Decomposes records into the `studies`, `endpoints` and
/// `baseline_measures` tables.
#[derive(Clone)]
pub struct SqliteTrialStore {
    db: Database,
}

impl SqliteTrialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Reads a record back from its stored document.
    pub async fn get(&self, nct_id: &str) -> Result<Option<TrialRecord>> {
        let row = sqlx::query("SELECT record_json FROM studies WHERE nct_id = ?")
            .bind(nct_id)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("record_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Endpoint names of one study, in stored order.
    pub async fn endpoint_names(&self, nct_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM endpoints WHERE nct_id = ? ORDER BY position")
            .bind(nct_id)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(|r| r.try_get("name").map_err(DbError::from)).collect()
    }
}

#[async_trait]
impl TrialStore for SqliteTrialStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self, record), fields(nct_id = %record.registry_id()))]
    async fn upsert(&self, record: &TrialRecord) -> Result<()> {
        let (study, endpoints, baselines) = decompose(record)?;
        if study.nct_id.trim().is_empty() {
            return Err(DbError::InvalidRecord("empty registry id".into()));
        }

        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            "INSERT INTO studies (
                nct_id, title, sponsor_name, sponsor_class, condition, start_date, study_type,
                phase, interventions, is_public, verification_status, evidence, verified_at,
                drug_name, dose, frequency, formulation, validation_status, provenance,
                publication_source, publication_id, publication_title, publication_rationale,
                publication_confidence, review_flags, unresolved_fields, record_json, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(nct_id) DO UPDATE SET
                title = excluded.title,
                sponsor_name = excluded.sponsor_name,
                sponsor_class = excluded.sponsor_class,
                condition = excluded.condition,
                start_date = excluded.start_date,
                study_type = excluded.study_type,
                phase = excluded.phase,
                interventions = excluded.interventions,
                is_public = excluded.is_public,
                verification_status = excluded.verification_status,
                evidence = excluded.evidence,
                verified_at = excluded.verified_at,
                drug_name = excluded.drug_name,
                dose = excluded.dose,
                frequency = excluded.frequency,
                formulation = excluded.formulation,
                validation_status = excluded.validation_status,
                provenance = excluded.provenance,
                publication_source = excluded.publication_source,
                publication_id = excluded.publication_id,
                publication_title = excluded.publication_title,
                publication_rationale = excluded.publication_rationale,
                publication_confidence = excluded.publication_confidence,
                review_flags = excluded.review_flags,
                unresolved_fields = excluded.unresolved_fields,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at",
        )
        .bind(&study.nct_id)
        .bind(&study.title)
        .bind(&study.sponsor_name)
        .bind(&study.sponsor_class)
        .bind(&study.condition)
        .bind(study.start_date)
        .bind(&study.study_type)
        .bind(&study.phase)
        .bind(&study.interventions)
        .bind(study.is_public)
        .bind(&study.verification_status)
        .bind(&study.evidence)
        .bind(study.verified_at)
        .bind(&study.drug_name)
        .bind(&study.dose)
        .bind(&study.frequency)
        .bind(&study.formulation)
        .bind(&study.validation_status)
        .bind(&study.provenance)
        .bind(&study.publication_source)
        .bind(&study.publication_id)
        .bind(&study.publication_title)
        .bind(&study.publication_rationale)
        .bind(&study.publication_confidence)
        .bind(&study.review_flags)
        .bind(&study.unresolved_fields)
        .bind(&study.record_json)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        // Child rows are owned by the study; replace them wholesale.
        sqlx::query("DELETE FROM endpoints WHERE nct_id = ?")
            .bind(&study.nct_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM baseline_measures WHERE nct_id = ?")
            .bind(&study.nct_id)
            .execute(&mut *tx)
            .await?;

        for e in &endpoints {
            sqlx::query(
                "INSERT INTO endpoints
                    (nct_id, position, name, description, timepoint, arm, average, upper, lower, is_significant)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&e.nct_id)
            .bind(e.position)
            .bind(&e.name)
            .bind(&e.description)
            .bind(&e.timepoint)
            .bind(&e.arm)
            .bind(e.average)
            .bind(e.upper)
            .bind(e.lower)
            .bind(e.is_significant)
            .execute(&mut *tx)
            .await?;
        }

        for b in &baselines {
            sqlx::query(
                "INSERT INTO baseline_measures
                    (nct_id, position, name, description, arm, average, upper, lower)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&b.nct_id)
            .bind(b.position)
            .bind(&b.name)
            .bind(&b.description)
            .bind(&b.arm)
            .bind(b.average)
            .bind(b.upper)
            .bind(b.lower)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(endpoints = endpoints.len(), baselines = baselines.len(), "study upserted");
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Keeps records in a map; used by tests and dry runs.
#[derive(Default)]
pub struct MemoryTrialStore {
    records: RwLock<BTreeMap<String, TrialRecord>>,
}

impl MemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, nct_id: &str) -> Option<TrialRecord> {
        self.records.read().await.get(nct_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records ordered by registry id.
    pub async fn records(&self) -> Vec<TrialRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl TrialStore for MemoryTrialStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, record: &TrialRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.registry_id().to_string(), record.clone());
        Ok(())
    }
}

// ── JSON documents ───────────────────────────────────────────────────────────

/// Writes one pretty-printed `<registry_id>.json` per record.
pub struct JsonExporter {
    dir: PathBuf,
}

impl JsonExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, nct_id: &str) -> PathBuf {
        self.dir.join(format!("{nct_id}.json"))
    }
}

#[async_trait]
impl TrialStore for JsonExporter {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn upsert(&self, record: &TrialRecord) -> Result<()> {
        let id = record.registry_id();
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(DbError::InvalidRecord(format!("unusable registry id {id:?}")));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(record)?;
        // Write then rename so readers never see a partial document.
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
