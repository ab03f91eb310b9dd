use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use trialink_common::{FilingRef, FormType, PublicationCandidate, PublicationSource, TrialStub};
use trialink_ingestion::caller::{CallError, CallResult, Failure, RateLimitedCaller};
use trialink_ingestion::sources::{
    FilingContent, FilingSearch, PublicationIndex, TrialQuery, TrialRegistry,
};
use trialink_llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};

/// Schema name the matcher attaches to judgment requests.
pub const JUDGMENT_SCHEMA: &str = "publication_judgment";

type Responder = dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync;

// ── LLM ──────────────────────────────────────────────────────────────────────

/// LLM backend answering from a closure. Every request is recorded.
pub struct ScriptedLlm {
    responder: Box<Responder>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self { responder: Box::new(responder), requests: Mutex::new(Vec::new()) }
    }

    /// Enrichment requests get `enrichment`, judgments get `judgment`.
    pub fn by_purpose(enrichment: impl Into<String>, judgment: impl Into<String>) -> Self {
        let enrichment = enrichment.into();
        let judgment = judgment.into();
        Self::new(move |req| {
            if is_judgment(req) {
                Ok(judgment.clone())
            } else {
                Ok(enrichment.clone())
            }
        })
    }

    /// Fails every request with the given HTTP status.
    pub fn failing(status: u16) -> Self {
        Self::new(move |_| Err(LlmError::ApiError { status, message: "scripted failure".into() }))
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests().len()
    }

    pub fn judgment_calls(&self) -> usize {
        self.requests().iter().filter(|r| is_judgment(r)).count()
    }

    pub fn enrichment_calls(&self) -> usize {
        self.calls() - self.judgment_calls()
    }
}

pub fn is_judgment(req: &LlmRequest) -> bool {
    req.schema_name.as_deref() == Some(JUDGMENT_SCHEMA)
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req.clone());
        }
        let content = (self.responder)(&req)?;
        Ok(LlmResponse {
            completion_tokens: content.len() as u32 / 4,
            prompt_tokens: req.messages.iter().map(|m| m.content.len() as u32 / 4).sum(),
            content,
            model: "scripted".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    fn host(&self) -> &str {
        "llm.test"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn max_context_tokens(&self) -> usize {
        32_000
    }
}

// ── Filing archive ───────────────────────────────────────────────────────────

fn company_key(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Filing search keyed by normalized company name. Unknown names get no
/// filings; names registered with [`FakeFilingSearch::fail`] get the error.
#[derive(Default)]
pub struct FakeFilingSearch {
    filings: HashMap<String, Vec<FilingRef>>,
    failures: HashMap<String, CallError>,
    delay: Option<Duration>,
    status: Option<u16>,
    calls: AtomicUsize,
}

impl FakeFilingSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, company: &str, filings: Vec<FilingRef>) -> Self {
        self.filings.insert(company_key(company), filings);
        self
    }

    pub fn fail(mut self, company: &str, error: CallError) -> Self {
        self.failures.insert(company_key(company), error);
        self
    }

    /// Holds every search open for `delay` so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answers every search attempt with HTTP `status` through the real
    /// caller, so its retry and cancellation handling applies.
    pub fn answering(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilingSearch for FakeFilingSearch {
    async fn search_filings(
        &self,
        caller: &RateLimitedCaller,
        company_name: &str,
        _form_types: &[FormType],
    ) -> CallResult<Vec<FilingRef>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.status {
            return caller
                .call("efts.sec.gov", |_| async move { Err(Failure::Status(status)) })
                .await;
        }
        let key = company_key(company_name);
        if let Some(error) = self.failures.get(&key) {
            return Err(error.clone());
        }
        Ok(self.filings.get(&key).cloned().unwrap_or_default())
    }
}

/// Filing text by accession id; unknown ids fail as a 404.
#[derive(Default)]
pub struct FakeFilingContent {
    texts: HashMap<String, String>,
    fetches: AtomicUsize,
}

impl FakeFilingContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, accession_id: &str, text: impl Into<String>) -> Self {
        self.texts.insert(accession_id.to_string(), text.into());
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilingContent for FakeFilingContent {
    async fn fetch_content(&self, _caller: &RateLimitedCaller, filing: &FilingRef) -> CallResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.texts.get(&filing.accession_id).cloned().ok_or_else(|| CallError::ClientError {
            host: "www.sec.gov".to_string(),
            status: Some(404),
            message: format!("no document for {}", filing.accession_id),
        })
    }
}

// ── Publications ─────────────────────────────────────────────────────────────

/// One publication index with a fixed result list, or a fixed failure.
pub struct FakeIndex {
    source: PublicationSource,
    results: Result<Vec<PublicationCandidate>, CallError>,
    searches: AtomicUsize,
}

impl FakeIndex {
    pub fn new(source: PublicationSource, results: Vec<PublicationCandidate>) -> Self {
        Self { source, results: Ok(results), searches: AtomicUsize::new(0) }
    }

    pub fn failing(source: PublicationSource) -> Self {
        Self {
            source,
            results: Err(CallError::Unavailable {
                host: format!("{}.test", source.as_str()),
                attempts: 3,
                last: "HTTP status 503".to_string(),
            }),
            searches: AtomicUsize::new(0),
        }
    }

    pub fn shared(self) -> Arc<dyn PublicationIndex> {
        Arc::new(self)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublicationIndex for FakeIndex {
    fn source(&self) -> PublicationSource {
        self.source
    }

    async fn search(
        &self,
        _caller: &RateLimitedCaller,
        _title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.results.clone().map(|r| r.into_iter().take(k).collect())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct FakeRegistry {
    trials: Vec<TrialStub>,
}

impl FakeRegistry {
    pub fn new(trials: Vec<TrialStub>) -> Self {
        Self { trials }
    }
}

#[async_trait]
impl TrialRegistry for FakeRegistry {
    async fn fetch_trials(&self, _caller: &RateLimitedCaller, query: &TrialQuery) -> CallResult<Vec<TrialStub>> {
        let limit = query.max_trials.unwrap_or(usize::MAX);
        Ok(self.trials.iter().take(limit).cloned().collect())
    }
}
