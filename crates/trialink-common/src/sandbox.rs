use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;
use url::Url;
use crate::error::TrialinkError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An HTTP client that only allows requests to approved domains.
///
/// Every source client in the pipeline goes through this, so a typo in a
/// base URL or a redirect-to-elsewhere in a filing link fails loudly instead
/// of silently hitting an unknown host.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a new SandboxClient with the default allowlist of registry,
    /// filing, publication-index and LLM domains.
    pub fn new() -> Result<Self, TrialinkError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TrialinkError> {
        let mut allowlist = HashSet::new();
        let domains = [
            "clinicaltrials.gov",       // Registry
            "efts.sec.gov",             // EDGAR full-text search
            "www.sec.gov",              // EDGAR archives
            "api.crossref.org",         // CrossRef
            "eutils.ncbi.nlm.nih.gov",  // PubMed
            "api.semanticscholar.org",  // Semantic Scholar
            "api.openalex.org",         // OpenAlex
            "api.openai.com",           // OpenAI LLMs
            "api.anthropic.com",        // Anthropic LLMs
            "localhost",                // Ollama local
            "127.0.0.1",                // Localhost alt
        ];

        for d in domains {
            allowlist.insert(d.to_string());
        }

        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(|e| TrialinkError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, allowlist })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Validates if a URL is permitted under the current sandbox policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        // Exact match or a subdomain of an allowed domain
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, TrialinkError> {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, TrialinkError> {
        self.request(reqwest::Method::POST, url)
    }

    pub fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, TrialinkError> {
        if !self.is_allowed(url) {
            warn!(url, "blocked request to host outside the allowlist");
            return Err(TrialinkError::Security(format!(
                "domain not in allowlist for URL {}",
                url
            )));
        }

        Ok(self.client.request(method, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlist_covers_sources() {
        let c = SandboxClient::new().unwrap();
        assert!(c.is_allowed("https://clinicaltrials.gov/api/v2/studies"));
        assert!(c.is_allowed("https://efts.sec.gov/LATEST/search-index?q=x"));
        assert!(c.is_allowed("https://api.openalex.org/works"));
    }

    #[test]
    fn test_subdomain_allowed_but_lookalike_rejected() {
        let c = SandboxClient::new().unwrap();
        assert!(c.is_allowed("https://foo.api.crossref.org/works"));
        assert!(!c.is_allowed("https://evilapi.crossref.org.attacker.net/"));
        assert!(!c.is_allowed("not a url"));
    }

    #[test]
    fn test_blocked_request_is_security_error() {
        let c = SandboxClient::new().unwrap();
        let err = c.get("https://example.com/").unwrap_err();
        assert!(matches!(err, TrialinkError::Security(_)));
    }

    #[test]
    fn test_allow_domain_extends_policy() {
        let mut c = SandboxClient::new().unwrap();
        assert!(!c.is_allowed("http://mirror.internal/filing.htm"));
        c.allow_domain("mirror.internal");
        assert!(c.is_allowed("http://mirror.internal/filing.htm"));
    }
}
