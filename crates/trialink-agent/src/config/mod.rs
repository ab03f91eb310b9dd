//! Configuration loading for trialink.
//! Reads trialink.toml from the current directory, the `--config` flag or the
//! path in the TRIALINK_CONFIG env var.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use trialink_common::PublicationSource;
use trialink_ingestion::matcher::DEFAULT_TOP_K;
use trialink_ingestion::{
    AcceptancePolicy, EnricherConfig, ExtractorConfig, PipelineConfig, RetryPolicy,
};

pub const DEFAULT_CONFIG_PATH: &str = "trialink.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub filings: FilingsConfig,
    #[serde(default)]
    pub publications: PublicationsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub caller: CallerConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub enricher: EnricherConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_study_type")]
    pub study_type: String,
    pub max_trials: Option<usize>,
}

fn default_study_type() -> String { "INTERVENTIONAL".to_string() }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { study_type: default_study_type(), max_trials: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilingsConfig {
    /// Sent as the User-Agent on filing archive requests: a name and a
    /// contact address, e.g. "Example Research research@example.com".
    #[serde(default)]
    pub identity: String,
}

#[derive(Debug, Deserialize)]
pub struct PublicationsConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<PublicationSource>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Contact address for the CrossRef and OpenAlex polite pools.
    pub mailto: Option<String>,
    pub pubmed_api_key: Option<SecretString>,
    pub semantic_scholar_api_key: Option<SecretString>,
}

fn default_sources() -> Vec<PublicationSource> {
    vec![
        PublicationSource::CrossRef,
        PublicationSource::PubMed,
        PublicationSource::SemanticScholar,
        PublicationSource::OpenAlex,
    ]
}
fn default_top_k() -> usize { DEFAULT_TOP_K }

impl Default for PublicationsConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            top_k: default_top_k(),
            mailto: None,
            pubmed_api_key: None,
            semantic_scholar_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Anthropic,
}

impl LlmProvider {
    /// Env var consulted when no key is configured.
    pub fn key_env(&self) -> &'static str {
        match self {
            LlmProvider::Ollama           => "TRIALINK_OLLAMA_API_KEY",
            LlmProvider::OpenAi           => "TRIALINK_OPENAI_API_KEY",
            LlmProvider::OpenAiCompatible => "TRIALINK_COMPAT_API_KEY",
            LlmProvider::Anthropic        => "TRIALINK_ANTHROPIC_API_KEY",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Required for `openai_compatible`; defaults to the local Ollama
    /// server for `ollama`.
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    /// Bound on one completion request; a stalled request counts as a
    /// transient failure.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_model() -> String { "llama3:8b".to_string() }
fn default_llm_timeout_secs() -> u64 { 120 }
pub fn default_ollama_url() -> String { "http://localhost:11434".to_string() }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: default_llm_model(),
            base_url: None,
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallerConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Default per-host admission rate; 0 disables the limiter.
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    /// Per-host rate overrides keyed by host name.
    #[serde(default = "default_host_limits")]
    pub hosts: BTreeMap<String, HostLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HostLimits {
    pub requests_per_second: u32,
}

fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 5 }
fn default_max_transient_attempts() -> u32 { 3 }
fn default_jitter_ms() -> u64 { 250 }
fn default_rps() -> u32 { 5 }

/// SEC asks for at most 10 requests per second; NCBI allows 3 without a key.
fn default_host_limits() -> BTreeMap<String, HostLimits> {
    [
        ("efts.sec.gov", 8),
        ("www.sec.gov", 8),
        ("eutils.ncbi.nlm.nih.gov", 3),
    ]
    .into_iter()
    .map(|(host, rps)| (host.to_string(), HostLimits { requests_per_second: rps }))
    .collect()
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            max_transient_attempts: default_max_transient_attempts(),
            jitter_ms: default_jitter_ms(),
            requests_per_second: default_rps(),
            hosts: default_host_limits(),
        }
    }
}

fn rate(rps: u32) -> Option<u32> {
    (rps > 0).then_some(rps)
}

impl CallerConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            max_transient_attempts: self.max_transient_attempts,
            jitter: Duration::from_millis(self.jitter_ms),
            requests_per_second: rate(self.requests_per_second),
        }
    }

    /// The default policy with each host's rate swapped in.
    pub fn host_policies(&self) -> Vec<(String, RetryPolicy)> {
        self.hosts
            .iter()
            .map(|(host, limits)| {
                let policy = RetryPolicy {
                    requests_per_second: rate(limits.requests_per_second),
                    ..self.to_policy()
                };
                (host.clone(), policy)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    #[serde(flatten)]
    pub run: PipelineConfig,
    #[serde(default)]
    pub acceptance: AcceptancePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Relational store; empty disables it.
    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
    /// One JSON document per trial when set.
    pub json_dir: Option<PathBuf>,
}

fn default_sqlite_url() -> String { "sqlite://trialink.db".to_string() }

impl Default for OutputConfig {
    fn default() -> Self {
        Self { sqlite_url: default_sqlite_url(), json_dir: None }
    }
}

/// Configured secret first, then the named env var. Blank values count as
/// unset.
pub fn resolve_key(configured: Option<&SecretString>, env_var: &str) -> Option<String> {
    configured
        .map(|k| k.expose_secret().trim().to_string())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
}

mod tests;

impl Config {
    /// Load configuration from `path`, TRIALINK_CONFIG or trialink.toml, in
    /// that order.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("TRIALINK_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        if !path.exists() {
            anyhow::bail!(
                "Config file not found: {}\n\
                 Copy trialink.example.toml to trialink.toml and edit it.",
                path.display()
            );
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.filings.identity.trim().is_empty() || !self.filings.identity.contains('@') {
            anyhow::bail!("filings.identity must name the requester and a contact email");
        }
        if self.publications.top_k == 0 {
            anyhow::bail!("publications.top_k must be at least 1");
        }
        if self.pipeline.run.max_concurrent_trials == 0 {
            anyhow::bail!("pipeline.max_concurrent_trials must be at least 1");
        }
        if self.llm.provider == LlmProvider::OpenAiCompatible && self.llm.base_url.is_none() {
            anyhow::bail!("llm.base_url is required for the openai_compatible provider");
        }
        if self.llm.timeout_secs == 0 {
            anyhow::bail!("llm.timeout_secs must be at least 1");
        }
        if self.caller.max_attempts == 0 || self.caller.max_transient_attempts == 0 {
            anyhow::bail!("caller attempt budgets must be at least 1");
        }
        Ok(())
    }

    pub fn llm_api_key(&self) -> Option<String> {
        resolve_key(self.llm.api_key.as_ref(), self.llm.provider.key_env())
    }

    pub fn pubmed_api_key(&self) -> Option<String> {
        resolve_key(self.publications.pubmed_api_key.as_ref(), "TRIALINK_PUBMED_API_KEY")
    }

    pub fn semantic_scholar_api_key(&self) -> Option<String> {
        resolve_key(
            self.publications.semantic_scholar_api_key.as_ref(),
            "TRIALINK_SEMANTIC_SCHOLAR_API_KEY",
        )
    }
}
