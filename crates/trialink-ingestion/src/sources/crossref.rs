//! CrossRef works search.
//!
//! API: https://api.crossref.org/works?query.bibliographic=...
//! Polite pool: the `mailto` parameter routes requests to CrossRef's
//! better-provisioned pool (see CrossRef etiquette).

use async_trait::async_trait;
use tracing::{debug, instrument};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{PublicationCandidate, PublicationSource, TrialinkError};

use super::{host_of, identify, strip_tags, PublicationIndex};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};

const CR_SEARCH_URL: &str = "https://api.crossref.org/works";

pub struct CrossRefClient {
    client: Client,
    host: String,
    mailto: Option<String>,
}

impl CrossRefClient {
    pub fn new(mailto: Option<String>) -> Result<Self, TrialinkError> {
        Ok(Self { client: Client::new()?, host: host_of(CR_SEARCH_URL), mailto })
    }
}

#[async_trait]
impl PublicationIndex for CrossRefClient {
    fn source(&self) -> PublicationSource {
        PublicationSource::CrossRef
    }

    #[instrument(skip(self, caller))]
    async fn search(
        &self,
        caller: &RateLimitedCaller,
        title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>> {
        let mut params = vec![
            ("query.bibliographic", title.to_string()),
            ("rows",   k.to_string()),
            ("select", "DOI,title,abstract,published,type".to_string()),
        ];
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.clone()));
        }

        let body: serde_json::Value = caller
            .call(&self.host, |attempt| {
                let req = self
                    .client
                    .get(CR_SEARCH_URL)
                    .map(|r| identify(r.query(&params), attempt, self.mailto.as_deref()));
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await?;

        let works = body["message"]["items"].as_array().cloned().unwrap_or_default();
        debug!(n = works.len(), "CrossRef search results");
        Ok(works
            .iter()
            .filter_map(work_to_candidate)
            .take(k)
            .enumerate()
            .map(|(i, mut c)| { c.rank = i + 1; c })
            .collect())
    }
}

// ── Conversion ─────────────────────────────────────────────────────────────

fn work_to_candidate(work: &serde_json::Value) -> Option<PublicationCandidate> {
    let doi = work["DOI"].as_str()?.to_string();

    let title = work["title"]
        .as_array()
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();

    // Abstracts arrive as JATS XML snippets
    let abstract_text = work["abstract"].as_str().map(strip_tags);

    let year = work["published"]["date-parts"]
        .as_array()
        .and_then(|dp| dp.first())
        .and_then(|dp| dp.as_array())
        .and_then(|parts| parts.first()?.as_i64())
        .map(|y| y as i32);

    Some(PublicationCandidate {
        source: PublicationSource::CrossRef,
        external_id: doi.clone(),
        title,
        abstract_text,
        rank: 0,
        doi: Some(doi),
        year,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_to_candidate_minimal() {
        let work = serde_json::json!({
            "DOI": "10.1056/NEJMoa2206038",
            "title": ["Tirzepatide Once Weekly for the Treatment of Obesity"],
            "abstract": "<jats:p>Obesity is a chronic disease.</jats:p>",
            "published": { "date-parts": [[2022, 7, 21]] }
        });
        let c = work_to_candidate(&work).unwrap();
        assert_eq!(c.external_id, "10.1056/NEJMoa2206038");
        assert_eq!(c.doi.as_deref(), Some("10.1056/NEJMoa2206038"));
        assert_eq!(c.abstract_text.as_deref(), Some("Obesity is a chronic disease."));
        assert_eq!(c.year, Some(2022));
    }

    #[test]
    fn test_work_without_doi_is_skipped() {
        assert!(work_to_candidate(&serde_json::json!({"title": ["x"]})).is_none());
    }
}
