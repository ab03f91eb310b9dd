//! External source clients.
//!
//! Every client performs its requests through the run's
//! [`RateLimitedCaller`]; none of them retries on its own.

pub mod registry;
pub mod edgar;
pub mod crossref;
pub mod pubmed;
pub mod semanticscholar;
pub mod openalex;

use async_trait::async_trait;
use chrono::NaiveDate;

use trialink_common::{FilingRef, FormType, PublicationCandidate, PublicationSource, TrialStub};

use crate::caller::{Attempt, CallResult, RateLimitedCaller};

pub use crossref::CrossRefClient;
pub use edgar::EdgarClient;
pub use openalex::OpenAlexClient;
pub use pubmed::PubMedClient;
pub use registry::RegistryClient;
pub use semanticscholar::SemanticScholarClient;

/// Registry query parameters.
#[derive(Debug, Clone, Default)]
pub struct TrialQuery {
    pub condition: String,
    pub study_type: Option<String>,
    pub since: Option<NaiveDate>,
    /// Stop paging after this many trials.
    pub max_trials: Option<usize>,
}

#[async_trait]
pub trait TrialRegistry: Send + Sync {
    async fn fetch_trials(
        &self,
        caller: &RateLimitedCaller,
        query: &TrialQuery,
    ) -> CallResult<Vec<TrialStub>>;
}

/// Full-text search over a filing archive.
#[async_trait]
pub trait FilingSearch: Send + Sync {
    async fn search_filings(
        &self,
        caller: &RateLimitedCaller,
        company_name: &str,
        form_types: &[FormType],
    ) -> CallResult<Vec<FilingRef>>;
}

/// Fetches a filing document and reduces it to plain text.
#[async_trait]
pub trait FilingContent: Send + Sync {
    async fn fetch_content(
        &self,
        caller: &RateLimitedCaller,
        filing: &FilingRef,
    ) -> CallResult<String>;
}

/// A scholarly publication index searchable by title.
#[async_trait]
pub trait PublicationIndex: Send + Sync {
    fn source(&self) -> PublicationSource;

    /// Top `k` candidates for `title`, ranked 1..=k in index order.
    async fn search(
        &self,
        caller: &RateLimitedCaller,
        title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>>;
}

/// Host part of a URL constant, used as the caller's rate-limiting key.
pub(crate) fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}

/// `User-Agent` for a remediated retry: the client name and version, plus a
/// contact address when one is configured. First attempts go out unchanged.
pub(crate) fn identify(
    req: reqwest::RequestBuilder,
    attempt: Attempt,
    contact: Option<&str>,
) -> reqwest::RequestBuilder {
    if !attempt.remediate {
        return req;
    }
    let agent = match contact {
        Some(contact) => format!("trialink/{} (mailto:{contact})", env!("CARGO_PKG_VERSION")),
        None => format!("trialink/{}", env!("CARGO_PKG_VERSION")),
    };
    req.header(reqwest::header::USER_AGENT, agent)
}

/// Drops markup tags and collapses whitespace. Good enough for abstracts
/// that arrive as JATS or HTML fragments.
pub(crate) fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
