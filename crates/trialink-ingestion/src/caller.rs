//! Rate-limited, retrying wrapper for every outbound call.
//!
//! Retry logic lives here and nowhere else. Sources and the LLM stages hand
//! `call` a closure that performs exactly one request and reports its outcome
//! as a [`Failure`]; the caller classifies it, sleeps, and tries again.
//!
//! | outcome        | behaviour                                              |
//! |----------------|--------------------------------------------------------|
//! | 429            | backoff, host cool-down, `max_attempts` budget          |
//! | 403            | one retry with `remediate = true`, then `Forbidden`     |
//! | timeout / 5xx  | backoff, separate `max_transient_attempts` budget      |
//! | other 4xx      | immediate `ClientError`                                |
//! | decode failure | immediate `ParseError`                                 |
//!
//! State shared between concurrent pipelines is per host only: an attempt
//! counter, an optional governor admission limiter, and a cool-down deadline
//! pushed forward by every 429 so that all pipelines back off together.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trialink_common::TrialinkError;
use trialink_llm::LlmError;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Outcome of a single attempt, as reported by the request closure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Failure {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("request refused locally: {0}")]
    Refused(String),
}

impl From<reqwest::Error> for Failure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Failure::Timeout
        } else if let Some(status) = e.status() {
            Failure::Status(status.as_u16())
        } else if e.is_decode() {
            Failure::Decode(e.to_string())
        } else {
            Failure::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Decode(e.to_string())
    }
}

impl From<TrialinkError> for Failure {
    fn from(e: TrialinkError) -> Self {
        match e {
            TrialinkError::Http(e) => e.into(),
            TrialinkError::Serialization(e) => e.into(),
            other => Failure::Refused(other.to_string()),
        }
    }
}

impl From<LlmError> for Failure {
    fn from(e: LlmError) -> Self {
        if e.is_timeout() {
            return Failure::Timeout;
        }
        if let Some(status) = e.status() {
            return Failure::Status(status);
        }
        match e {
            LlmError::Http(e) => e.into(),
            LlmError::Serde(e) => e.into(),
            other => Failure::Transport(other.to_string()),
        }
    }
}

/// Classified, final outcome of a call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("{host}: rate limited after {attempts} attempts")]
    RateLimited { host: String, attempts: u32 },
    #[error("{host}: forbidden (remediated retry also refused)")]
    Forbidden { host: String },
    #[error("{host}: client error: {message}")]
    ClientError { host: String, status: Option<u16>, message: String },
    #[error("{host}: unavailable after {attempts} attempts: {last}")]
    Unavailable { host: String, attempts: u32, last: String },
    #[error("{host}: could not decode response: {message}")]
    ParseError { host: String, message: String },
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }
}

pub type CallResult<T> = std::result::Result<T, CallError>;

/// Turns a non-2xx response into a [`Failure::Status`].
pub fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, Failure> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(Failure::Status(status.as_u16()))
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts allowed to come back 429 before giving up.
    pub max_attempts: u32,
    /// Total attempts allowed to time out or hit 5xx before giving up.
    pub max_transient_attempts: u32,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
    /// Per-host admission rate; `None` disables the limiter.
    pub requests_per_second: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            max_transient_attempts: 3,
            jitter: Duration::from_millis(250),
            requests_per_second: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    ///
    /// `min(base × 2^retry, max_delay) + jitter`, never shorter than the
    /// previous delay of the same call.
    pub fn backoff_delay(&self, retry: u32, previous: Duration, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        (exp + jitter.min(self.jitter)).max(previous)
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max = self.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

// ── Per-host state ────────────────────────────────────────────────────────────

struct HostState {
    limiter: Option<DefaultDirectRateLimiter>,
    attempts: AtomicU64,
    cooldown_until: Mutex<Option<Instant>>,
}

impl HostState {
    fn new(rps: Option<u32>) -> Self {
        let limiter = rps
            .and_then(NonZeroU32::new)
            .map(|n| RateLimiter::direct(Quota::per_second(n)));
        Self {
            limiter,
            attempts: AtomicU64::new(0),
            cooldown_until: Mutex::new(None),
        }
    }

    async fn extend_cooldown(&self, delay: Duration) -> Instant {
        let until = Instant::now() + delay;
        let mut guard = self.cooldown_until.lock().await;
        let deadline = match *guard {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        *guard = Some(deadline);
        deadline
    }

    async fn cooldown(&self) -> Option<Instant> {
        let guard = self.cooldown_until.lock().await;
        (*guard).filter(|d| *d > Instant::now())
    }
}

/// What the request closure is told about the attempt it is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number within this call.
    pub number: u32,
    /// Set after a 403: add the identification headers the host demands.
    pub remediate: bool,
}

// ── Caller ────────────────────────────────────────────────────────────────────

pub struct RateLimitedCaller {
    policy: RetryPolicy,
    overrides: HashMap<String, RetryPolicy>,
    hosts: Mutex<HashMap<String, Arc<HostState>>>,
    cancel: CancellationToken,
}

impl RateLimitedCaller {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            overrides: HashMap::new(),
            hosts: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Uses `policy` instead of the default for one host.
    pub fn with_host_policy(mut self, host: impl Into<String>, policy: RetryPolicy) -> Self {
        self.overrides.insert(host.into(), policy);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn policy_for(&self, host: &str) -> &RetryPolicy {
        self.overrides.get(host).unwrap_or(&self.policy)
    }

    async fn host_state(&self, host: &str) -> Arc<HostState> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new(self.policy_for(host).requests_per_second)))
            .clone()
    }

    /// Total attempts made against `host` so far in this run.
    pub async fn attempts(&self, host: &str) -> u64 {
        let hosts = self.hosts.lock().await;
        hosts
            .get(host)
            .map(|h| h.attempts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn sleep_until(&self, deadline: Instant) -> CallResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }

    /// Runs `request` against `host` under the retry policy.
    pub async fn call<T, F, Fut>(&self, host: &str, mut request: F) -> CallResult<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let policy = self.policy_for(host).clone();
        let state = self.host_state(host).await;

        let mut number = 0u32;
        let mut remediate = false;
        let mut rate_limited = 0u32;
        let mut transient = 0u32;
        let mut last_delay = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }
            if let Some(deadline) = state.cooldown().await {
                self.sleep_until(deadline).await?;
            }
            if let Some(limiter) = &state.limiter {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                    _ = limiter.until_ready() => {}
                }
            }

            number += 1;
            let total = state.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(host, attempt = number, host_attempts = total, remediate, "outbound call");

            let failure = match request(Attempt { number, remediate }).await {
                Ok(value) => return Ok(value),
                Err(f) => f,
            };

            match failure {
                Failure::Status(429) => {
                    rate_limited += 1;
                    if rate_limited >= policy.max_attempts {
                        warn!(host, attempts = number, "rate limit budget exhausted");
                        return Err(CallError::RateLimited { host: host.to_string(), attempts: number });
                    }
                    let delay = policy.backoff_delay(rate_limited - 1, last_delay, policy.sample_jitter());
                    last_delay = delay;
                    warn!(host, attempt = number, delay_ms = delay.as_millis() as u64, "429, backing off");
                    let deadline = state.extend_cooldown(delay).await;
                    self.sleep_until(deadline).await?;
                }
                Failure::Status(403) => {
                    if remediate {
                        warn!(host, attempt = number, "403 after remediation");
                        return Err(CallError::Forbidden { host: host.to_string() });
                    }
                    warn!(host, attempt = number, "403, retrying with remediation headers");
                    remediate = true;
                }
                Failure::Status(status) if status >= 500 => {
                    transient += 1;
                    if transient >= policy.max_transient_attempts {
                        return Err(CallError::Unavailable {
                            host: host.to_string(),
                            attempts: number,
                            last: format!("HTTP {}", status),
                        });
                    }
                    let delay = policy.backoff_delay(transient - 1, last_delay, policy.sample_jitter());
                    last_delay = delay;
                    warn!(host, attempt = number, status, delay_ms = delay.as_millis() as u64, "server error, backing off");
                    self.sleep_until(Instant::now() + delay).await?;
                }
                Failure::Timeout | Failure::Transport(_) => {
                    transient += 1;
                    if transient >= policy.max_transient_attempts {
                        return Err(CallError::Unavailable {
                            host: host.to_string(),
                            attempts: number,
                            last: failure.to_string(),
                        });
                    }
                    let delay = policy.backoff_delay(transient - 1, last_delay, policy.sample_jitter());
                    last_delay = delay;
                    warn!(host, attempt = number, error = %failure, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                    self.sleep_until(Instant::now() + delay).await?;
                }
                Failure::Status(status) => {
                    return Err(CallError::ClientError {
                        host: host.to_string(),
                        status: Some(status),
                        message: format!("HTTP {}", status),
                    });
                }
                Failure::Refused(message) => {
                    return Err(CallError::ClientError { host: host.to_string(), status: None, message });
                }
                Failure::Decode(message) => {
                    return Err(CallError::ParseError { host: host.to_string(), message });
                }
            }
        }
    }
}
