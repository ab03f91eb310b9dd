//! ClinicalTrials.gov v2 API client.
//!
//! API docs: https://clinicaltrials.gov/data-api/api
//! Endpoint: https://clinicaltrials.gov/api/v2/studies
//!
//! Paged with `pageToken` / `nextPageToken`. Start date and study type are
//! pushed into `filter.advanced` so the registry does the filtering.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, instrument, warn};
use trialink_common::sandbox::SandboxClient as Client;
use trialink_common::{SponsorClass, TrialStub, TrialinkError};

use super::{host_of, identify, TrialQuery, TrialRegistry};
use crate::caller::{ensure_success, CallResult, Failure, RateLimitedCaller};

const CT_API_URL: &str = "https://clinicaltrials.gov/api/v2/studies";
const PAGE_SIZE: usize = 100;
const FIELDS: &str = "NCTId,BriefTitle,LeadSponsorName,LeadSponsorClass,Condition,\
                      StartDate,StudyType,Phase,InterventionName";

pub struct RegistryClient {
    client: Client,
    host: String,
}

impl RegistryClient {
    pub fn new() -> Result<Self, TrialinkError> {
        Ok(Self { client: Client::new()?, host: host_of(CT_API_URL) })
    }

    async fn fetch_page(
        &self,
        caller: &RateLimitedCaller,
        params: &[(&str, String)],
    ) -> CallResult<serde_json::Value> {
        caller
            .call(&self.host, |attempt| {
                let req = self.client.get(CT_API_URL).map(|r| identify(r.query(params), attempt, None));
                async move {
                    let resp = ensure_success(req?.send().await?)?;
                    Ok::<_, Failure>(resp.json::<serde_json::Value>().await?)
                }
            })
            .await
    }
}

/// `filter.advanced` expression for the optional start-date and study-type
/// constraints.
fn advanced_filter(query: &TrialQuery) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(since) = query.since {
        parts.push(format!("AREA[StartDate]RANGE[{},MAX]", since.format("%Y-%m-%d")));
    }
    if let Some(study_type) = &query.study_type {
        parts.push(format!("AREA[StudyType]{}", study_type.to_ascii_uppercase()));
    }
    (!parts.is_empty()).then(|| parts.join(" AND "))
}

#[async_trait]
impl TrialRegistry for RegistryClient {
    #[instrument(skip(self, caller), fields(condition = %query.condition))]
    async fn fetch_trials(
        &self,
        caller: &RateLimitedCaller,
        query: &TrialQuery,
    ) -> CallResult<Vec<TrialStub>> {
        let mut trials = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let limit = query.max_trials.unwrap_or(usize::MAX);

        loop {
            let mut params = vec![
                ("query.cond", query.condition.clone()),
                ("pageSize",   PAGE_SIZE.to_string()),
                ("format",     "json".to_string()),
                ("fields",     FIELDS.to_string()),
            ];
            if let Some(filter) = advanced_filter(query) {
                params.push(("filter.advanced", filter));
            }
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page = self.fetch_page(caller, &params).await?;
            let studies = page["studies"].as_array().cloned().unwrap_or_default();
            debug!(n = studies.len(), "registry page retrieved");
            trials.extend(studies.iter().filter_map(study_to_stub));

            page_token = next_page_token(&page, &mut seen_tokens);
            if page_token.is_none() || studies.is_empty() || trials.len() >= limit {
                break;
            }
        }

        trials.truncate(limit);
        Ok(trials)
    }
}

/// The page token to request next, or `None` at the end. A token the
/// registry has already handed out ends paging too.
fn next_page_token(page: &serde_json::Value, seen: &mut HashSet<String>) -> Option<String> {
    let token = page["nextPageToken"].as_str()?;
    if !seen.insert(token.to_string()) {
        warn!(token, "registry repeated a page token, stopping");
        return None;
    }
    Some(token.to_string())
}

/// Registry dates come as `YYYY-MM-DD` or `YYYY-MM`.
fn parse_registry_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d"))
        .ok()
}

fn study_to_stub(study: &serde_json::Value) -> Option<TrialStub> {
    let proto      = &study["protocolSection"];
    let id_mod     = &proto["identificationModule"];
    let status_mod = &proto["statusModule"];
    let design_mod = &proto["designModule"];
    let cond_mod   = &proto["conditionsModule"];
    let interv_mod = &proto["armsInterventionsModule"];
    let lead       = &proto["sponsorCollaboratorsModule"]["leadSponsor"];

    let registry_id = id_mod["nctId"].as_str()?.to_string();

    let phase = design_mod["phases"]
        .as_array()
        .map(|p| p.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join("/"))
        .filter(|p| !p.is_empty());

    let interventions = interv_mod["interventions"]
        .as_array()
        .map(|iv| iv.iter()
            .filter_map(|v| v["name"].as_str().map(String::from))
            .collect())
        .unwrap_or_default();

    Some(TrialStub {
        registry_id,
        title:         id_mod["briefTitle"].as_str().unwrap_or("").to_string(),
        sponsor_name:  lead["name"].as_str().unwrap_or("").trim().to_string(),
        condition:     cond_mod["conditions"]
            .as_array()
            .and_then(|c| c.first())
            .and_then(|c| c.as_str())
            .map(String::from),
        start_date:    status_mod["startDateStruct"]["date"]
            .as_str()
            .and_then(parse_registry_date),
        study_type:    design_mod["studyType"].as_str().unwrap_or("UNKNOWN").to_string(),
        sponsor_class: lead["class"]
            .as_str()
            .map(SponsorClass::from_registry)
            .unwrap_or(SponsorClass::Unknown),
        phase,
        interventions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_page_token_ends_paging() {
        let mut seen = HashSet::new();
        let page = serde_json::json!({ "studies": [], "nextPageToken": "abc" });
        assert_eq!(next_page_token(&page, &mut seen).as_deref(), Some("abc"));
        assert_eq!(next_page_token(&page, &mut seen), None);

        let next = serde_json::json!({ "studies": [], "nextPageToken": "def" });
        assert_eq!(next_page_token(&next, &mut seen).as_deref(), Some("def"));
        assert_eq!(next_page_token(&serde_json::json!({ "studies": [] }), &mut seen), None);
    }

    #[test]
    fn test_study_to_stub() {
        let study = serde_json::json!({
            "protocolSection": {
                "identificationModule": { "nctId": "NCT05036135", "briefTitle": "Tirzepatide in Obesity" },
                "statusModule": { "startDateStruct": { "date": "2021-03" } },
                "designModule": { "studyType": "INTERVENTIONAL", "phases": ["PHASE3"] },
                "conditionsModule": { "conditions": ["Obesity", "Overweight"] },
                "armsInterventionsModule": { "interventions": [{ "name": "Tirzepatide" }, { "name": "Placebo" }] },
                "sponsorCollaboratorsModule": { "leadSponsor": { "name": "Eli Lilly and Company", "class": "INDUSTRY" } }
            }
        });
        let stub = study_to_stub(&study).unwrap();
        assert_eq!(stub.registry_id, "NCT05036135");
        assert_eq!(stub.sponsor_class, SponsorClass::Industry);
        assert_eq!(stub.start_date, NaiveDate::from_ymd_opt(2021, 3, 1));
        assert_eq!(stub.condition.as_deref(), Some("Obesity"));
        assert_eq!(stub.phase.as_deref(), Some("PHASE3"));
        assert_eq!(stub.interventions, vec!["Tirzepatide", "Placebo"]);
    }

    #[test]
    fn test_study_without_id_is_skipped() {
        assert!(study_to_stub(&serde_json::json!({"protocolSection": {}})).is_none());
    }

    #[test]
    fn test_advanced_filter() {
        let q = TrialQuery {
            condition: "obesity".into(),
            study_type: Some("interventional".into()),
            since: NaiveDate::from_ymd_opt(2020, 1, 1),
            max_trials: None,
        };
        assert_eq!(
            advanced_filter(&q).as_deref(),
            Some("AREA[StartDate]RANGE[2020-01-01,MAX] AND AREA[StudyType]INTERVENTIONAL")
        );
        assert!(advanced_filter(&TrialQuery::default()).is_none());
    }

    #[tokio::test]
    #[ignore] // requires network
    async fn test_fetch_trials_live() {
        let caller = RateLimitedCaller::new(Default::default(), Default::default());
        let client = RegistryClient::new().unwrap();
        let q = TrialQuery { condition: "obesity".into(), max_trials: Some(5), ..Default::default() };
        let trials = client.fetch_trials(&caller, &q).await.unwrap();
        assert!(!trials.is_empty());
    }
}
