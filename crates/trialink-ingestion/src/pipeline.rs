//! End-to-end resolution pipeline.
//!
//! Orchestrates one run over a batch of registry trials:
//!   1. Drop repeated registry ids
//!   2. Per trial, exclude non-industry sponsors, then resolve the sponsor
//!      (cached, single-flight per run)
//!   3. Exclude trials that fail the rest of the eligibility policy
//!   4. Concurrently: fetch filings → extract mention windows → enrich,
//!      and retrieve + judge publication candidates
//!   5. Assemble the record and upsert it into every configured store
//!   6. Emit progress events via broadcast channel
//!
//! Trials run concurrently up to `max_concurrent_trials`. The pipeline is
//! non-destructive: failures degrade the affected branch and are flagged on
//! the record; only eligibility removes a trial from the output.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use trialink_common::{EnrichedMetadata, FilingRef, MentionWindow, TrialRecord, TrialStub};
use trialink_db::TrialStore;

use crate::assembler::{assemble, class_exclusion, exclusion_reason, EvidenceSummary};
use crate::caller::CallResult;
use crate::context::RunContext;
use crate::enricher::MetadataEnricher;
use crate::extractor::MentionExtractor;
use crate::matcher::PublicationMatcher;
use crate::sources::{FilingContent, TrialQuery, TrialRegistry};
use crate::verifier::SponsorVerifier;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_trials")]
    pub max_concurrent_trials: usize,
    /// Newest filings per sponsor whose text is searched for mentions.
    #[serde(default = "default_max_filings_per_sponsor")]
    pub max_filings_per_sponsor: usize,
}

fn default_max_concurrent_trials() -> usize { 4 }
fn default_max_filings_per_sponsor() -> usize { 5 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_trials: default_max_concurrent_trials(),
            max_filings_per_sponsor: default_max_filings_per_sponsor(),
        }
    }
}

// ── Progress events ───────────────────────────────────────────────────────────

/// Progress event emitted during a run (cloneable for broadcast).
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub stage: String,
    pub trial_id: Option<String>,
    pub message: String,
    pub completed: usize,
    pub total: usize,
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// A trial dropped by the eligibility policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exclusion {
    pub trial_id: String,
    pub sponsor_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Recorded(Box<TrialRecord>),
    Excluded(Exclusion),
    /// Cancelled before or during processing; nothing was kept.
    Cancelled(String),
}

// ── Result summary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trials_seen: usize,
    pub duplicates_skipped: usize,
    /// Ordered by registry id.
    pub records: Vec<TrialRecord>,
    pub excluded: Vec<Exclusion>,
    pub cancelled: Vec<String>,
    pub persist_errors: Vec<String>,
    pub llm_calls: usize,
    pub llm_prompt_tokens: u64,
    pub llm_completion_tokens: u64,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn needs_review(&self) -> usize {
        self.records.iter().filter(|r| r.needs_review()).count()
    }
}

/// Keeps the first occurrence of each registry id.
pub fn dedupe_trials(trials: Vec<TrialStub>) -> (Vec<TrialStub>, usize) {
    let before = trials.len();
    let mut seen = HashSet::new();
    let unique: Vec<TrialStub> = trials
        .into_iter()
        .filter(|t| seen.insert(t.registry_id.clone()))
        .collect();
    let skipped = before - unique.len();
    (unique, skipped)
}

// ── Filing text cache ─────────────────────────────────────────────────────────

/// Run-scoped, single-flight filing text by accession id. Trials of the same
/// sponsor share filings; each one is downloaded at most once per run. A
/// failed download is remembered as `None`.
#[derive(Default)]
pub struct FilingTextCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Option<Arc<str>>>>>>,
}

impl FilingTextCache {
    pub async fn get_or_fetch<F, Fut>(&self, accession_id: &str, fetch: F) -> Option<Arc<str>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallResult<String>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(accession_id.to_string()).or_default().clone()
        };
        cell.get_or_init(|| async {
            match fetch().await {
                Ok(text) => Some(Arc::from(text)),
                Err(e) => {
                    warn!(accession_id, error = %e, "filing fetch failed");
                    None
                }
            }
        })
        .await
        .clone()
    }

    pub async fn len(&self) -> usize {
        self.cells.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn excluded(trial: TrialStub, reason: String) -> TrialOutcome {
    TrialOutcome::Excluded(Exclusion {
        trial_id: trial.registry_id,
        sponsor_name: trial.sponsor_name,
        reason,
    })
}

// ── Pipeline orchestrator ─────────────────────────────────────────────────────

pub struct TrialPipeline {
    verifier: SponsorVerifier,
    content: Arc<dyn FilingContent>,
    extractor: MentionExtractor,
    enricher: MetadataEnricher,
    matcher: PublicationMatcher,
    stores: Vec<Arc<dyn TrialStore>>,
    config: PipelineConfig,
}

impl TrialPipeline {
    pub fn new(
        verifier: SponsorVerifier,
        content: Arc<dyn FilingContent>,
        extractor: MentionExtractor,
        enricher: MetadataEnricher,
        matcher: PublicationMatcher,
    ) -> Self {
        Self {
            verifier,
            content,
            extractor,
            enricher,
            matcher,
            stores: Vec::new(),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TrialStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetches trials from `registry` and resolves them. Fails only when the
    /// registry itself cannot be read.
    pub async fn run_query(
        &self,
        ctx: &RunContext,
        registry: &dyn TrialRegistry,
        query: &TrialQuery,
        progress_tx: Option<broadcast::Sender<RunProgress>>,
    ) -> CallResult<RunReport> {
        let trials = registry.fetch_trials(&ctx.caller, query).await?;
        info!(condition = %query.condition, trials = trials.len(), "registry query complete");
        Ok(self.run(ctx, trials, progress_tx).await)
    }

    /// Resolves every trial in `trials`.
    ///
    /// Progress events are sent via `progress_tx` if provided.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, trials = trials.len()))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        trials: Vec<TrialStub>,
        progress_tx: Option<broadcast::Sender<RunProgress>>,
    ) -> RunReport {
        let t0 = Instant::now();
        let trials_seen = trials.len();
        let (trials, duplicates_skipped) = dedupe_trials(trials);
        if duplicates_skipped > 0 {
            debug!(duplicates_skipped, "skipping repeated registry ids");
        }
        let total = trials.len();

        let emit = |stage: &str, trial_id: Option<&str>, message: String, completed: usize| {
            if let Some(ref tx) = progress_tx {
                let _ = tx.send(RunProgress {
                    run_id: ctx.run_id,
                    stage: stage.to_string(),
                    trial_id: trial_id.map(String::from),
                    message,
                    completed,
                    total,
                });
            }
        };

        emit("start", None, format!("Resolving {total} trials"), 0);
        info!(total, concurrency = self.config.max_concurrent_trials, "starting run");

        let filings = &FilingTextCache::default();
        let mut outcomes = stream::iter(trials)
            .map(move |trial| async move {
                let outcome = self.process_trial(ctx, trial, filings).await;
                let persist_errors = match &outcome {
                    TrialOutcome::Recorded(record) => self.persist(record).await,
                    _ => Vec::new(),
                };
                (outcome, persist_errors)
            })
            .buffer_unordered(self.config.max_concurrent_trials.max(1));

        let mut report = RunReport {
            run_id: ctx.run_id,
            trials_seen,
            duplicates_skipped,
            records: Vec::new(),
            excluded: Vec::new(),
            cancelled: Vec::new(),
            persist_errors: Vec::new(),
            llm_calls: 0,
            llm_prompt_tokens: 0,
            llm_completion_tokens: 0,
            duration_ms: 0,
        };

        let mut completed = 0;
        while let Some((outcome, persist_errors)) = outcomes.next().await {
            completed += 1;
            report.persist_errors.extend(persist_errors);
            match outcome {
                TrialOutcome::Recorded(record) => {
                    emit(
                        "record",
                        Some(record.registry_id()),
                        format!("{} flags", record.review_flags.len()),
                        completed,
                    );
                    report.records.push(*record);
                }
                TrialOutcome::Excluded(exclusion) => {
                    emit("excluded", Some(&exclusion.trial_id), exclusion.reason.clone(), completed);
                    report.excluded.push(exclusion);
                }
                TrialOutcome::Cancelled(trial_id) => {
                    emit("cancelled", Some(&trial_id), "discarded".to_string(), completed);
                    report.cancelled.push(trial_id);
                }
            }
        }

        report.records.sort_by(|a, b| a.trial.registry_id.cmp(&b.trial.registry_id));
        report.excluded.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));
        report.cancelled.sort();

        let audit = ctx.audit_entries().await;
        report.llm_calls = audit.len();
        report.llm_prompt_tokens = audit.iter().map(|e| e.prompt_tokens as u64).sum();
        report.llm_completion_tokens = audit.iter().map(|e| e.completion_tokens as u64).sum();
        report.duration_ms = t0.elapsed().as_millis() as u64;

        emit(
            "complete",
            None,
            format!(
                "{} records, {} excluded, {} cancelled",
                report.records.len(),
                report.excluded.len(),
                report.cancelled.len()
            ),
            completed,
        );
        info!(
            records = report.records.len(),
            excluded = report.excluded.len(),
            cancelled = report.cancelled.len(),
            llm_calls = report.llm_calls,
            duration_ms = report.duration_ms,
            "run complete"
        );
        report
    }

    /// One trial from sponsor verification to assembled record. Does not
    /// persist.
    #[instrument(skip_all, fields(trial_id = %trial.registry_id))]
    pub async fn process_trial(
        &self,
        ctx: &RunContext,
        trial: TrialStub,
        filings: &FilingTextCache,
    ) -> TrialOutcome {
        if ctx.is_cancelled() {
            return TrialOutcome::Cancelled(trial.registry_id);
        }

        if let Some(reason) = class_exclusion(&trial) {
            debug!(%reason, "trial excluded before sponsor search");
            return excluded(trial, reason);
        }

        let resolution = match self
            .verifier
            .resolve(&ctx.caller, &ctx.verdicts, &trial.sponsor_name)
            .await
        {
            Ok(resolution) => resolution,
            Err(_) => {
                info!("run cancelled during sponsor verification, discarding");
                return TrialOutcome::Cancelled(trial.registry_id);
            }
        };
        if ctx.is_cancelled() {
            return TrialOutcome::Cancelled(trial.registry_id);
        }
        let verdict = resolution.verdict.clone();

        if let Some(reason) = exclusion_reason(&trial, &verdict) {
            debug!(%reason, "trial excluded");
            return excluded(trial, reason);
        }

        let ((metadata, evidence), outcome) = tokio::join!(
            self.gather_metadata(ctx, &trial, &resolution.filings, filings),
            self.matcher.match_trial(ctx, &trial),
        );

        if ctx.is_cancelled() {
            info!("run cancelled mid-trial, discarding");
            return TrialOutcome::Cancelled(trial.registry_id);
        }

        TrialOutcome::Recorded(Box::new(assemble(trial, verdict, metadata, &outcome, evidence)))
    }

    /// Evidence branch: filing text → mention windows → enriched metadata.
    async fn gather_metadata(
        &self,
        ctx: &RunContext,
        trial: &TrialStub,
        sponsor_filings: &[FilingRef],
        cache: &FilingTextCache,
    ) -> (EnrichedMetadata, EvidenceSummary) {
        let selected = &sponsor_filings[..sponsor_filings.len().min(self.config.max_filings_per_sponsor)];
        let texts = join_all(selected.iter().map(|filing| {
            cache.get_or_fetch(&filing.accession_id, move || self.content.fetch_content(&ctx.caller, filing))
        }))
        .await;

        let mut summary = EvidenceSummary { filings_searched: selected.len(), ..Default::default() };
        let mut windows: Vec<MentionWindow> = Vec::new();
        for (filing, text) in selected.iter().zip(texts) {
            match text {
                Some(text) => windows.extend(self.extractor.extract(filing, &text, trial)),
                None => summary.filings_failed += 1,
            }
        }
        summary.windows = windows.len();
        debug!(
            filings = summary.filings_searched,
            failed = summary.filings_failed,
            windows = summary.windows,
            "mention extraction complete"
        );

        let metadata = self.enricher.enrich(ctx, trial, &windows).await;
        (metadata, summary)
    }

    async fn persist(&self, record: &TrialRecord) -> Vec<String> {
        let mut errors = Vec::new();
        for store in &self.stores {
            if let Err(e) = store.upsert(record).await {
                warn!(store = store.name(), trial_id = record.registry_id(), error = %e, "persist failed");
                errors.push(format!("{}: {}: {e}", store.name(), record.registry_id()));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trialink_common::SponsorClass;

    use crate::caller::CallError;

    fn stub(id: &str) -> TrialStub {
        TrialStub {
            registry_id: id.into(),
            title: "t".into(),
            sponsor_name: "s".into(),
            condition: None,
            start_date: None,
            study_type: "INTERVENTIONAL".into(),
            sponsor_class: SponsorClass::Industry,
            phase: None,
            interventions: vec![],
        }
    }

    #[test]
    fn test_dedupe_trials_keeps_first() {
        let mut second = stub("NCT1");
        second.title = "later copy".into();
        let (unique, skipped) = dedupe_trials(vec![stub("NCT1"), stub("NCT2"), second]);
        assert_eq!(skipped, 1);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].title, "t");
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_trials, 4);
        assert_eq!(config.max_filings_per_sponsor, 5);
    }

    #[tokio::test]
    async fn test_filing_cache_fetches_once() {
        let cache = FilingTextCache::default();
        let counter = AtomicUsize::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>("annual report text".to_string())
        };

        let (a, b) = tokio::join!(cache.get_or_fetch("0001", fetch), cache.get_or_fetch("0001", fetch));
        assert_eq!(a.as_deref(), Some("annual report text"));
        assert_eq!(b.as_deref(), Some("annual report text"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_filing_cache_remembers_failure() {
        let cache = FilingTextCache::default();
        let counter = AtomicUsize::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(CallError::Forbidden { host: "www.sec.gov".into() })
        };
        assert!(cache.get_or_fetch("0002", fetch).await.is_none());
        assert!(cache.get_or_fetch("0002", fetch).await.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
