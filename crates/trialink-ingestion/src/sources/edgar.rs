//! SEC EDGAR client: full-text filing search and document download.
//!
//! Search:   https://efts.sec.gov/LATEST/search-index
//! Archives: https://www.sec.gov/Archives/edgar/data/{cik}/{accession}/{file}
//!
//! SEC refuses anonymous automated traffic with 403. The client sends its
//! identification `User-Agent` when the caller asks for remediation.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use tracing::{debug, instrument};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{FilingRef, FormType, TrialinkError};

use super::{host_of, FilingContent, FilingSearch};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};
use crate::normalise::{html_to_text, looks_like_pdf, pdf_to_text};

const EFTS_URL:     &str = "https://efts.sec.gov/LATEST/search-index";
const ARCHIVES_URL: &str = "https://www.sec.gov/Archives/edgar/data";

pub struct EdgarClient {
    client: Client,
    /// Value sent as `User-Agent` on remediated requests, e.g.
    /// `"Example Corp research@example.com"`.
    identity: String,
    search_host: String,
    archive_host: String,
}

impl EdgarClient {
    pub fn new(identity: impl Into<String>) -> Result<Self, TrialinkError> {
        Ok(Self {
            client: Client::new()?,
            identity: identity.into(),
            search_host: host_of(EFTS_URL),
            archive_host: host_of(ARCHIVES_URL),
        })
    }
}

/// Full-text search expression restricting hits to `company_name` and the
/// given form types.
pub fn search_expression(company_name: &str, form_types: &[FormType]) -> String {
    let name = company_name.replace('"', "");
    let forms = form_types
        .iter()
        .filter(|f| **f != FormType::Other)
        .map(|f| f.as_str())
        .collect::<Vec<_>>();
    match forms.as_slice() {
        [] => format!("companyName:\"{}\"", name),
        [first, rest @ ..] => {
            let mut clause = format!("formType:{}", first);
            for f in rest {
                clause.push_str(" OR ");
                clause.push_str(f);
            }
            format!("companyName:\"{}\" AND ({})", name, clause)
        }
    }
}

#[async_trait]
impl FilingSearch for EdgarClient {
    #[instrument(skip(self, caller))]
    async fn search_filings(
        &self,
        caller: &RateLimitedCaller,
        company_name: &str,
        form_types: &[FormType],
    ) -> CallResult<Vec<FilingRef>> {
        let q = search_expression(company_name, form_types);
        let forms = form_types
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let body: serde_json::Value = caller
            .call(&self.search_host, |attempt| {
                let req = self.client.get(EFTS_URL).map(|r| {
                    let r = r.query(&[("q", q.as_str()), ("forms", forms.as_str())]);
                    if attempt.remediate { r.header(USER_AGENT, &self.identity) } else { r }
                });
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await?;

        let mut filings = parse_search_hits(&body);
        filings.sort_by(|a, b| b.filed_at.cmp(&a.filed_at));
        debug!(n = filings.len(), "EDGAR filings found");
        Ok(filings)
    }
}

#[async_trait]
impl FilingContent for EdgarClient {
    #[instrument(skip(self, caller, filing), fields(accession = %filing.accession_id))]
    async fn fetch_content(
        &self,
        caller: &RateLimitedCaller,
        filing: &FilingRef,
    ) -> CallResult<String> {
        let url = filing.source_url.as_str();
        let host = host_of(url);
        let host = if host.is_empty() { self.archive_host.clone() } else { host };

        caller
            .call(&host, |attempt| {
                let req = self.client.get(url).map(|r| {
                    if attempt.remediate { r.header(USER_AGENT, &self.identity) } else { r }
                });
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    let bytes = resp.bytes().await?;
                    if looks_like_pdf(url, content_type.as_deref(), &bytes) {
                        pdf_to_text(&bytes).map_err(|e| Failure::Decode(e.to_string()))
                    } else {
                        Ok(html_to_text(&String::from_utf8_lossy(&bytes)))
                    }
                }
            })
            .await
    }
}

// ── Conversion ─────────────────────────────────────────────────────────────

fn parse_search_hits(body: &serde_json::Value) -> Vec<FilingRef> {
    body["hits"]["hits"]
        .as_array()
        .map(|hits| hits.iter().filter_map(hit_to_filing).collect())
        .unwrap_or_default()
}

fn hit_to_filing(hit: &serde_json::Value) -> Option<FilingRef> {
    // _id is "<accession>:<primary document file name>"
    let (accession, file) = hit["_id"].as_str()?.split_once(':')?;
    let src = &hit["_source"];

    let cik = src["ciks"]
        .as_array()
        .and_then(|c| c.first())
        .and_then(|c| c.as_str())
        .map(|c| c.trim_start_matches('0').to_string())
        .filter(|c| !c.is_empty())?;

    let form = src["form"]
        .as_str()
        .or_else(|| src["root_form"].as_str())
        .unwrap_or("");

    Some(FilingRef {
        accession_id: accession.to_string(),
        form_type:    FormType::parse(form),
        filed_at:     src["file_date"]
            .as_str()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        source_url:   format!("{}/{}/{}/{}", ARCHIVES_URL, cik, accession.replace('-', ""), file),
        cik:          Some(cik),
        filer_name:   src["display_names"]
            .as_array()
            .and_then(|n| n.first())
            .and_then(|n| n.as_str())
            .map(String::from),
    })
}
