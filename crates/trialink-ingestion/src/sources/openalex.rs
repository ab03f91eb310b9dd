//! OpenAlex works search.
//!
//! API: https://api.openalex.org/works?search=...
//! Abstracts are only published as an inverted index (word → positions) and
//! are rebuilt here.

use async_trait::async_trait;
use tracing::{debug, instrument};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{PublicationCandidate, PublicationSource, TrialinkError};

use super::{host_of, identify, PublicationIndex};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};

const OA_WORKS_URL: &str = "https://api.openalex.org/works";

pub struct OpenAlexClient {
    client: Client,
    host: String,
    mailto: Option<String>,
}

impl OpenAlexClient {
    pub fn new(mailto: Option<String>) -> Result<Self, TrialinkError> {
        Ok(Self { client: Client::new()?, host: host_of(OA_WORKS_URL), mailto })
    }
}

#[async_trait]
impl PublicationIndex for OpenAlexClient {
    fn source(&self) -> PublicationSource {
        PublicationSource::OpenAlex
    }

    #[instrument(skip(self, caller))]
    async fn search(
        &self,
        caller: &RateLimitedCaller,
        title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>> {
        // The search parameter treats commas as filter separators
        let mut params = vec![
            ("search",   title.replace(',', " ")),
            ("per-page", k.to_string()),
        ];
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.clone()));
        }

        let body: serde_json::Value = caller
            .call(&self.host, |attempt| {
                let req = self
                    .client
                    .get(OA_WORKS_URL)
                    .map(|r| identify(r.query(&params), attempt, self.mailto.as_deref()));
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await?;

        let works = body["results"].as_array().cloned().unwrap_or_default();
        debug!(n = works.len(), "OpenAlex search results");
        Ok(works
            .iter()
            .filter_map(work_to_candidate)
            .take(k)
            .enumerate()
            .map(|(i, mut c)| { c.rank = i + 1; c })
            .collect())
    }
}

/// Rebuilds abstract text from OpenAlex's `abstract_inverted_index`.
fn rebuild_abstract(index: &serde_json::Value) -> Option<String> {
    let map = index.as_object()?;
    let mut positioned: Vec<(u64, &str)> = map
        .iter()
        .flat_map(|(word, positions)| {
            positions
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|p| p.as_u64())
                .map(move |p| (p, word.as_str()))
        })
        .collect();
    if positioned.is_empty() {
        return None;
    }
    positioned.sort_by_key(|(p, _)| *p);
    Some(positioned.into_iter().map(|(_, w)| w).collect::<Vec<_>>().join(" "))
}

fn work_to_candidate(work: &serde_json::Value) -> Option<PublicationCandidate> {
    let id = work["id"].as_str()?;
    let external_id = id.rsplit('/').next().unwrap_or(id).to_string();
    let title = work["title"]
        .as_str()
        .or_else(|| work["display_name"].as_str())
        .unwrap_or("")
        .to_string();

    Some(PublicationCandidate {
        source: PublicationSource::OpenAlex,
        external_id,
        title,
        abstract_text: rebuild_abstract(&work["abstract_inverted_index"]),
        rank: 0,
        doi: work["doi"]
            .as_str()
            .map(|d| d.trim_start_matches("https://doi.org/").to_string()),
        year: work["publication_year"].as_i64().map(|y| y as i32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_abstract() {
        let idx = serde_json::json!({ "is": [1], "Obesity": [0], "chronic.": [3], "a": [2] });
        assert_eq!(rebuild_abstract(&idx).as_deref(), Some("Obesity is a chronic."));
        assert_eq!(rebuild_abstract(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_work_to_candidate() {
        let work = serde_json::json!({
            "id": "https://openalex.org/W4281924310",
            "title": "Tirzepatide Once Weekly for the Treatment of Obesity",
            "doi": "https://doi.org/10.1056/nejmoa2206038",
            "publication_year": 2022,
            "abstract_inverted_index": null
        });
        let c = work_to_candidate(&work).unwrap();
        assert_eq!(c.external_id, "W4281924310");
        assert_eq!(c.doi.as_deref(), Some("10.1056/nejmoa2206038"));
        assert_eq!(c.abstract_text, None);
    }
}
