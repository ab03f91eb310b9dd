//! Sponsor public-status verification.
//!
//! A sponsor counts as public iff the filing archive returns at least one
//! annual or current report filed under its name. Verdicts are cached for
//! the whole run under a normalized sponsor key, and concurrent first
//! requests for the same key share one search.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use trialink_common::{FilingRef, FormType, SponsorVerdict, VerificationStatus};

use crate::caller::{CallError, CallResult, RateLimitedCaller};
use crate::sources::FilingSearch;

/// A verdict together with the filings that support it.
#[derive(Debug, Clone, PartialEq)]
pub struct SponsorResolution {
    pub verdict: SponsorVerdict,
    /// Deduplicated by accession id, newest first.
    pub filings: Vec<FilingRef>,
}

/// Lowercased, trimmed, internal whitespace collapsed.
pub fn normalize_sponsor(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

type Cell = Arc<OnceCell<Arc<SponsorResolution>>>;

/// Single-flight, run-scoped cache of sponsor resolutions.
#[derive(Default)]
pub struct VerdictCache {
    cells: Mutex<HashMap<String, Cell>>,
}

impl VerdictCache {
    /// Returns the cached resolution for `key`, computing it with `resolve`
    /// if nobody has yet. Concurrent callers for the same key wait for the
    /// first one instead of resolving again. An error is returned to the
    /// caller and leaves the key unresolved.
    pub async fn get_or_resolve<F, Fut, E>(&self, key: &str, resolve: F) -> Result<Arc<SponsorResolution>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SponsorResolution, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key.to_string()).or_default().clone()
        };
        cell.get_or_try_init(|| async { resolve().await.map(Arc::new) })
            .await
            .cloned()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<SponsorResolution>> {
        let cells = self.cells.lock().await;
        cells.get(key).and_then(|c| c.get().cloned())
    }

    /// Number of resolved sponsors.
    pub async fn len(&self) -> usize {
        self.cells.lock().await.values().filter(|c| c.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Keeps the first filing per accession id and orders newest first.
pub fn dedup_filings(filings: Vec<FilingRef>) -> Vec<FilingRef> {
    let mut seen = HashSet::new();
    let mut unique: Vec<FilingRef> = filings
        .into_iter()
        .filter(|f| seen.insert(f.accession_id.clone()))
        .collect();
    unique.sort_by(|a, b| b.filed_at.cmp(&a.filed_at));
    unique
}

pub struct SponsorVerifier {
    search: Arc<dyn FilingSearch>,
    form_types: Vec<FormType>,
}

impl SponsorVerifier {
    pub fn new(search: Arc<dyn FilingSearch>) -> Self {
        Self { search, form_types: vec![FormType::TenK, FormType::EightK] }
    }

    /// Verdict for `sponsor_name`, reusing the run's cached resolution. A
    /// cancelled search yields an unverified verdict that is not cached.
    pub async fn verify(
        &self,
        caller: &RateLimitedCaller,
        cache: &VerdictCache,
        sponsor_name: &str,
    ) -> SponsorVerdict {
        match self.resolve(caller, cache, sponsor_name).await {
            Ok(resolution) => resolution.verdict.clone(),
            Err(_) => unverified(sponsor_name.trim()).verdict,
        }
    }

    /// Verdict plus supporting filings, cached per normalized sponsor name.
    /// Fails only with [`CallError::Cancelled`]; every other search failure
    /// resolves to an unverified verdict.
    pub async fn resolve(
        &self,
        caller: &RateLimitedCaller,
        cache: &VerdictCache,
        sponsor_name: &str,
    ) -> CallResult<Arc<SponsorResolution>> {
        let key = normalize_sponsor(sponsor_name);
        cache
            .get_or_resolve(&key, || self.search_sponsor(caller, sponsor_name))
            .await
    }

    async fn search_sponsor(&self, caller: &RateLimitedCaller, sponsor_name: &str) -> CallResult<SponsorResolution> {
        let sponsor_name = sponsor_name.trim();
        if sponsor_name.is_empty() {
            debug!("empty sponsor name, not searching");
            return Ok(unverified(sponsor_name));
        }

        match self.search.search_filings(caller, sponsor_name, &self.form_types).await {
            Ok(filings) => {
                let filings = dedup_filings(filings);
                let evidence = filings.iter().map(|f| f.accession_id.clone()).collect::<Vec<_>>();
                info!(sponsor = sponsor_name, filings = filings.len(), "sponsor verified");
                Ok(SponsorResolution {
                    verdict: SponsorVerdict {
                        sponsor_name: sponsor_name.to_string(),
                        is_public: !filings.is_empty(),
                        status: VerificationStatus::Verified,
                        evidence,
                        verified_at: Utc::now(),
                    },
                    filings,
                })
            }
            Err(CallError::Cancelled) => {
                debug!(sponsor = sponsor_name, "sponsor search cancelled");
                Err(CallError::Cancelled)
            }
            Err(e) => {
                warn!(sponsor = sponsor_name, error = %e, "sponsor verification failed");
                Ok(unverified(sponsor_name))
            }
        }
    }
}

fn unverified(sponsor_name: &str) -> SponsorResolution {
    SponsorResolution {
        verdict: SponsorVerdict {
            sponsor_name: sponsor_name.to_string(),
            is_public: false,
            status: VerificationStatus::Unverified,
            evidence: Vec::new(),
            verified_at: Utc::now(),
        },
        filings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn filing(acc: &str, date: (i32, u32, u32)) -> FilingRef {
        FilingRef {
            accession_id: acc.to_string(),
            form_type: FormType::TenK,
            filed_at: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            source_url: format!("https://www.sec.gov/Archives/edgar/data/1/{acc}/doc.htm"),
            cik: Some("1".into()),
            filer_name: None,
        }
    }

    #[test]
    fn test_normalize_sponsor() {
        assert_eq!(normalize_sponsor("  Eli   Lilly and\tCompany "), "eli lilly and company");
        assert_eq!(normalize_sponsor("ELI LILLY AND COMPANY"), normalize_sponsor("Eli Lilly and Company"));
    }

    #[test]
    fn test_dedup_filings_keeps_newest_first() {
        let out = dedup_filings(vec![
            filing("a", (2021, 1, 1)),
            filing("b", (2023, 1, 1)),
            filing("a", (2022, 1, 1)),
        ]);
        let ids: Vec<_> = out.iter().map(|f| f.accession_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(out[1].filed_at, NaiveDate::from_ymd_opt(2021, 1, 1));
    }

    #[tokio::test]
    async fn test_cache_computes_once_per_key() {
        let cache = VerdictCache::default();
        let runs = std::sync::atomic::AtomicUsize::new(0);
        let resolve = || async {
            runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, CallError>(unverified("Acme"))
        };
        let first = cache.get_or_resolve("acme", resolve).await.unwrap();
        let second = cache.get_or_resolve("acme", resolve).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("acme").await.is_some());
        assert!(cache.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_resolution_is_not_cached() {
        let cache = VerdictCache::default();
        let cancelled = cache
            .get_or_resolve("acme", || async { Err::<SponsorResolution, _>(CallError::Cancelled) })
            .await;
        assert_eq!(cancelled, Err(CallError::Cancelled));
        assert!(cache.get("acme").await.is_none());
        assert!(cache.is_empty().await);

        let retried = cache
            .get_or_resolve("acme", || async { Ok::<_, CallError>(unverified("Acme")) })
            .await
            .unwrap();
        assert_eq!(retried.verdict.sponsor_name, "Acme");
        assert_eq!(cache.len().await, 1);
    }
}
