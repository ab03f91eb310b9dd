//! Per-run context shared by every trial pipeline.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use trialink_llm::{CallPurpose, LlmAuditEntry, LlmBackend, LlmRequest, LlmResponse};

use crate::caller::{CallResult, Failure, RateLimitedCaller, RetryPolicy};
use crate::verifier::VerdictCache;

/// Everything a run shares across concurrently processed trials: the
/// caller (and with it per-host limiter state), the sponsor verdict cache,
/// the cancellation token and the LLM audit trail.
///
/// Built fresh for every run; nothing here outlives it.
pub struct RunContext {
    pub run_id: Uuid,
    pub caller: Arc<RateLimitedCaller>,
    pub verdicts: VerdictCache,
    pub cancel: CancellationToken,
    audit: Mutex<Vec<LlmAuditEntry>>,
}

impl RunContext {
    pub fn new(policy: RetryPolicy) -> Self {
        let cancel = CancellationToken::new();
        let caller = RateLimitedCaller::new(policy, cancel.clone());
        Self::with_caller(caller)
    }

    /// Wraps an already configured caller; the run cancels through the
    /// caller's token.
    pub fn with_caller(caller: RateLimitedCaller) -> Self {
        let cancel = caller.cancellation().clone();
        Self {
            run_id: Uuid::new_v4(),
            caller: Arc::new(caller),
            verdicts: VerdictCache::default(),
            cancel,
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn record_llm_call(&self, entry: LlmAuditEntry) {
        self.audit.lock().await.push(entry);
    }

    pub async fn audit_entries(&self) -> Vec<LlmAuditEntry> {
        self.audit.lock().await.clone()
    }

    /// One LLM completion through the shared caller, keyed by the backend's
    /// host, with an audit entry recorded on success.
    pub async fn complete(
        &self,
        backend: &dyn LlmBackend,
        trial_id: &str,
        purpose: CallPurpose,
        request: LlmRequest,
    ) -> CallResult<LlmResponse> {
        let started = Instant::now();
        let response = self
            .caller
            .call(backend.host(), |_| {
                let request = request.clone();
                async move { backend.complete(request).await.map_err(Failure::from) }
            })
            .await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            trial_id,
            model = %response.model,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            latency_ms,
            "LLM call complete"
        );
        self.record_llm_call(LlmAuditEntry::new(self.run_id, trial_id, purpose, &response, latency_ms))
            .await;
        Ok(response)
    }
}
