//! Semantic Scholar Graph API paper search.
//!
//! API: https://api.semanticscholar.org/graph/v1/paper/search
//! Unauthenticated traffic shares a small global quota, so 429s are routine
//! here; an API key (`x-api-key`) raises it.

use async_trait::async_trait;
use tracing::{debug, instrument};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{PublicationCandidate, PublicationSource, TrialinkError};

use super::{host_of, identify, PublicationIndex};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};

const S2_SEARCH_URL: &str = "https://api.semanticscholar.org/graph/v1/paper/search";

pub struct SemanticScholarClient {
    client: Client,
    host: String,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(api_key: Option<String>) -> Result<Self, TrialinkError> {
        Ok(Self { client: Client::new()?, host: host_of(S2_SEARCH_URL), api_key })
    }
}

#[async_trait]
impl PublicationIndex for SemanticScholarClient {
    fn source(&self) -> PublicationSource {
        PublicationSource::SemanticScholar
    }

    #[instrument(skip(self, caller))]
    async fn search(
        &self,
        caller: &RateLimitedCaller,
        title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>> {
        let params = [
            ("query",  title.to_string()),
            ("limit",  k.to_string()),
            ("fields", "title,abstract,year,externalIds".to_string()),
        ];

        let body: serde_json::Value = caller
            .call(&self.host, |attempt| {
                let req = self.client.get(S2_SEARCH_URL).map(|r| {
                    let r = identify(r.query(&params), attempt, None);
                    match &self.api_key {
                        Some(key) => r.header("x-api-key", key),
                        None => r,
                    }
                });
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await?;

        let papers = body["data"].as_array().cloned().unwrap_or_default();
        debug!(n = papers.len(), "Semantic Scholar search results");
        Ok(papers
            .iter()
            .filter_map(paper_to_candidate)
            .take(k)
            .enumerate()
            .map(|(i, mut c)| { c.rank = i + 1; c })
            .collect())
    }
}

fn paper_to_candidate(paper: &serde_json::Value) -> Option<PublicationCandidate> {
    Some(PublicationCandidate {
        source: PublicationSource::SemanticScholar,
        external_id: paper["paperId"].as_str()?.to_string(),
        title: paper["title"].as_str().unwrap_or("").to_string(),
        abstract_text: paper["abstract"].as_str().map(String::from),
        rank: 0,
        doi: paper["externalIds"]["DOI"].as_str().map(String::from),
        year: paper["year"].as_i64().map(|y| y as i32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_to_candidate() {
        let paper = serde_json::json!({
            "paperId": "a1b2c3",
            "title": "Tirzepatide Once Weekly for the Treatment of Obesity",
            "abstract": null,
            "year": 2022,
            "externalIds": { "DOI": "10.1056/NEJMoa2206038", "PubMed": "35658024" }
        });
        let c = paper_to_candidate(&paper).unwrap();
        assert_eq!(c.external_id, "a1b2c3");
        assert_eq!(c.abstract_text, None);
        assert_eq!(c.doi.as_deref(), Some("10.1056/NEJMoa2206038"));
        assert_eq!(c.year, Some(2022));
    }
}
