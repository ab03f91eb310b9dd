//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, instrument, warn};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{PublicationCandidate, PublicationSource, TrialinkError};

use super::{host_of, identify, PublicationIndex};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const EFETCH_URL:  &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

pub struct PubMedClient {
    client: Client,
    host: String,
    api_key: Option<String>,
}

impl PubMedClient {
    pub fn new(api_key: Option<String>) -> Result<Self, TrialinkError> {
        Ok(Self { client: Client::new()?, host: host_of(ESEARCH_URL), api_key })
    }

    fn with_key(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Search PubMed titles and return PMIDs in relevance order.
    async fn esearch(&self, caller: &RateLimitedCaller, title: &str, max: usize) -> CallResult<Vec<String>> {
        let params = self.with_key(vec![
            ("db",      "pubmed".to_string()),
            ("term",    format!("{}[Title]", title.replace(['[', ']'], " "))),
            ("retmax",  max.to_string()),
            ("retmode", "json".to_string()),
            ("sort",    "relevance".to_string()),
        ]);

        let resp: serde_json::Value = caller
            .call(&self.host, |attempt| {
                let req = self.client.get(ESEARCH_URL).map(|r| identify(r.query(&params), attempt, None));
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await?;

        let ids = resp["esearchresult"]["idlist"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        debug!(?ids, "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    async fn efetch(&self, caller: &RateLimitedCaller, pmids: &[String]) -> CallResult<String> {
        let params = self.with_key(vec![
            ("db",      "pubmed".to_string()),
            ("id",      pmids.join(",")),
            ("rettype", "abstract".to_string()),
            ("retmode", "xml".to_string()),
        ]);

        caller
            .call(&self.host, |attempt| {
                let req = self.client.get(EFETCH_URL).map(|r| identify(r.query(&params), attempt, None));
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.text().await?)
                }
            })
            .await
    }
}

#[async_trait]
impl PublicationIndex for PubMedClient {
    fn source(&self) -> PublicationSource {
        PublicationSource::PubMed
    }

    #[instrument(skip(self, caller))]
    async fn search(
        &self,
        caller: &RateLimitedCaller,
        title: &str,
        k: usize,
    ) -> CallResult<Vec<PublicationCandidate>> {
        let pmids = self.esearch(caller, title, k).await?;
        if pmids.is_empty() {
            return Ok(vec![]);
        }
        let xml = self.efetch(caller, &pmids).await?;
        let mut found = parse_pubmed_xml(&xml);

        // efetch does not preserve esearch order
        found.sort_by_key(|c| pmids.iter().position(|p| *p == c.external_id).unwrap_or(usize::MAX));
        Ok(found
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(i, mut c)| { c.rank = i + 1; c })
            .collect())
    }
}

fn attr_is(e: &BytesStart, name: &[u8], value: &str) -> bool {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v == value))
        .unwrap_or(false)
}

/// Parse PubMed XML (efetch abstract mode) into candidates.
/// Handles the <PubmedArticleSet><PubmedArticle> structure.
fn parse_pubmed_xml(xml: &str) -> Vec<PublicationCandidate> {
    let mut out = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // State machine for XML parsing
    let mut current: Option<PublicationCandidate> = None;
    let mut in_pmid     = false;
    let mut in_title    = false;
    let mut in_abstract = false;
    let mut in_pub_date = false;
    let mut in_year     = false;
    let mut in_doi      = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.name().as_ref() {
                    b"PubmedArticle" => {
                        current = Some(PublicationCandidate {
                            source: PublicationSource::PubMed,
                            external_id: String::new(),
                            title: String::new(),
                            abstract_text: None,
                            rank: 0,
                            doi: None,
                            year: None,
                        });
                    }
                    b"PMID"         => in_pmid = true,
                    b"ArticleTitle" => in_title = true,
                    b"AbstractText" => in_abstract = true,
                    b"PubDate"      => in_pub_date = true,
                    b"Year"         => in_year = in_pub_date,
                    b"ELocationID"  => in_doi = attr_is(e, b"EIdType", "doi"),
                    b"ArticleId"    => in_doi = attr_is(e, b"IdType", "doi"),
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if let Some(ref mut c) = current {
                    // Comment/correction blocks carry their own PMIDs; keep the first
                    if in_pmid && c.external_id.is_empty() { c.external_id = text.clone(); }
                    if in_title {
                        if !c.title.is_empty() { c.title.push(' '); }
                        c.title.push_str(&text);
                    }
                    if in_abstract {
                        let a = c.abstract_text.get_or_insert_with(String::new);
                        if !a.is_empty() { a.push(' '); }
                        a.push_str(&text);
                    }
                    if in_year && c.year.is_none() { c.year = text.parse().ok(); }
                    if in_doi && c.doi.is_none() { c.doi = Some(text.clone()); }
                }
            }
            Ok(Event::End(ref e)) => {
                match e.name().as_ref() {
                    b"PMID"         => in_pmid = false,
                    b"ArticleTitle" => in_title = false,
                    b"AbstractText" => in_abstract = false,
                    b"PubDate"      => in_pub_date = false,
                    b"Year"         => in_year = false,
                    b"ELocationID" | b"ArticleId" => in_doi = false,
                    b"PubmedArticle" => {
                        if let Some(c) = current.take() {
                            if !c.title.is_empty() && !c.external_id.is_empty() {
                                out.push(c);
                            } else {
                                warn!("Skipping PubMed article with empty title or PMID");
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("XML parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    out
}
