//! trialink: links registered clinical trials to sponsor filings and
//! publications, and writes one enriched record per trial.
//! Entry point for the command-line binary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trialink_common::PublicationSource;
use trialink_db::{Database, JsonExporter, SqliteTrialStore};
use trialink_ingestion::sources::{
    CrossRefClient, EdgarClient, OpenAlexClient, PubMedClient, PublicationIndex, RegistryClient,
    SemanticScholarClient, TrialQuery,
};
use trialink_ingestion::{
    MentionExtractor, MetadataEnricher, PublicationMatcher, RateLimitedCaller,
    RunContext, RunProgress, SponsorVerifier, TrialPipeline,
};
use trialink_llm::backend::{AnthropicBackend, OllamaBackend, OpenAiBackend, OpenAiCompatibleBackend};
use trialink_llm::LlmBackend;

use config::{Config, LlmProvider};

/// Command-line arguments for trialink
#[derive(Parser, Debug)]
#[command(name = "trialink")]
#[command(about = "Link industry-sponsored clinical trials to filings and publications")]
#[command(version)]
struct Args {
    /// Condition to query the trial registry for, e.g. "obesity"
    #[arg(short, long)]
    condition: String,

    /// Registry study type; overrides registry.study_type
    #[arg(long)]
    study_type: Option<String>,

    /// Only trials starting on or after this date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Stop after this many trials; overrides registry.max_trials
    #[arg(long)]
    max_trials: Option<usize>,

    /// Path to the config file
    #[arg(long, env = "TRIALINK_CONFIG")]
    config: Option<PathBuf>,
}

fn build_llm_backend(config: &Config) -> Arc<dyn LlmBackend> {
    let llm = &config.llm;
    let key = config.llm_api_key();
    let timeout = Duration::from_secs(llm.timeout_secs);
    match llm.provider {
        LlmProvider::Ollama => {
            let base_url = llm.base_url.clone().unwrap_or_else(config::default_ollama_url);
            Arc::new(OllamaBackend::new(base_url, &llm.model).with_timeout(timeout))
        }
        LlmProvider::OpenAi => {
            if key.is_none() {
                warn!("OpenAI selected but no API key found (set llm.api_key or {})", llm.provider.key_env());
            }
            Arc::new(OpenAiBackend::new(key.unwrap_or_default(), &llm.model).with_timeout(timeout))
        }
        LlmProvider::Anthropic => {
            if key.is_none() {
                warn!("Anthropic selected but no API key found (set llm.api_key or {})", llm.provider.key_env());
            }
            Arc::new(AnthropicBackend::new(key.unwrap_or_default(), &llm.model).with_timeout(timeout))
        }
        LlmProvider::OpenAiCompatible => {
            let base_url = llm.base_url.clone().unwrap_or_default();
            Arc::new(OpenAiCompatibleBackend::new(base_url, &llm.model, key).with_timeout(timeout))
        }
    }
}

fn build_indices(config: &Config) -> anyhow::Result<Vec<Arc<dyn PublicationIndex>>> {
    let mailto = &config.publications.mailto;
    let mut indices: Vec<Arc<dyn PublicationIndex>> = Vec::new();
    for source in &config.publications.sources {
        let index: Arc<dyn PublicationIndex> = match source {
            PublicationSource::CrossRef => Arc::new(CrossRefClient::new(mailto.clone())?),
            PublicationSource::PubMed => Arc::new(PubMedClient::new(config.pubmed_api_key())?),
            PublicationSource::SemanticScholar => {
                Arc::new(SemanticScholarClient::new(config.semantic_scholar_api_key())?)
            }
            PublicationSource::OpenAlex => Arc::new(OpenAlexClient::new(mailto.clone())?),
        };
        indices.push(index);
    }
    if indices.is_empty() {
        warn!("No publication sources enabled; trials will carry no publication match.");
    }
    Ok(indices)
}

async fn build_pipeline(config: &Config) -> anyhow::Result<TrialPipeline> {
    let llm = build_llm_backend(config);
    info!(model = llm.model_id(), host = llm.host(), "LLM backend ready");

    let edgar = Arc::new(EdgarClient::new(config.filings.identity.clone())?);
    let matcher = PublicationMatcher::new(build_indices(config)?, llm.clone())
        .with_policy(config.pipeline.acceptance)
        .with_top_k(config.publications.top_k);

    let mut pipeline = TrialPipeline::new(
        SponsorVerifier::new(edgar.clone()),
        edgar,
        MentionExtractor::new(config.extractor.clone()),
        MetadataEnricher::new(llm, config.enricher.clone()),
        matcher,
    )
    .with_config(config.pipeline.run.clone());

    if !config.output.sqlite_url.trim().is_empty() {
        let db = Database::open(&config.output.sqlite_url)
            .await
            .with_context(|| format!("Failed to open {}", config.output.sqlite_url))?;
        db.initialize().await.context("Failed to create tables")?;
        info!(url = db.url(), "SQLite store ready");
        pipeline = pipeline.with_store(Arc::new(SqliteTrialStore::new(db)));
    }
    if let Some(dir) = &config.output.json_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        info!(dir = %dir.display(), "JSON export enabled");
        pipeline = pipeline.with_store(Arc::new(JsonExporter::new(dir)));
    }
    Ok(pipeline)
}

fn build_context(config: &Config, cancel: CancellationToken) -> RunContext {
    let mut caller = RateLimitedCaller::new(config.caller.to_policy(), cancel);
    for (host, policy) in config.caller.host_policies() {
        caller = caller.with_host_policy(host, policy);
    }
    RunContext::with_caller(caller)
}

/// Logs progress events until the run drops its sender.
fn spawn_progress_logger(mut rx: broadcast::Receiver<RunProgress>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(p) => info!(
                    stage = %p.stage,
                    trial = p.trial_id.as_deref().unwrap_or("-"),
                    "[{}/{}] {}", p.completed, p.total, p.message
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "progress logger lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trialink=debug,info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("trialink {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(args.config.as_deref())?;
    info!(
        provider = ?config.llm.provider,
        model = %config.llm.model,
        sources = config.publications.sources.len(),
        acceptance = ?config.pipeline.acceptance,
        "Configuration loaded"
    );

    let pipeline = build_pipeline(&config).await?;
    let registry = RegistryClient::new()?;

    let cancel = CancellationToken::new();
    let ctx = build_context(&config, cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling run");
            cancel.cancel();
        }
    });

    let (progress_tx, progress_rx) = broadcast::channel(256);
    spawn_progress_logger(progress_rx);

    let query = TrialQuery {
        condition: args.condition,
        study_type: Some(args.study_type.unwrap_or_else(|| config.registry.study_type.clone())),
        since: args.since,
        max_trials: args.max_trials.or(config.registry.max_trials),
    };
    let report = pipeline
        .run_query(&ctx, &registry, &query, Some(progress_tx))
        .await
        .context("Registry query failed")?;

    info!(
        run_id = %report.run_id,
        records = report.records.len(),
        excluded = report.excluded.len(),
        cancelled = report.cancelled.len(),
        needs_review = report.needs_review(),
        llm_calls = report.llm_calls,
        duration_ms = report.duration_ms,
        "Run complete"
    );
    for error in &report.persist_errors {
        warn!("persist error: {error}");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
