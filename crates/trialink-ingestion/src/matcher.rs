//! Publication candidate retrieval and LLM-judged matching.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use trialink_common::{
    MatchConfidence, MatchDecision, MatchVerdict, PublicationCandidate, PublicationSource, TrialStub,
};
use trialink_llm::{parse_structured, schema_for, CallPurpose, LlmBackend, LlmRequest, Message};

use crate::context::RunContext;
use crate::sources::PublicationIndex;

/// Candidates retrieved per source.
pub const DEFAULT_TOP_K: usize = 3;

/// How to pick among several candidates judged `match`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptancePolicy {
    /// First `match` in source-then-rank order.
    #[default]
    FirstMatch,
    /// Highest-confidence `match`; ties go to the earlier candidate.
    HighestConfidence,
}

impl AcceptancePolicy {
    pub fn select(&self, judgments: &[MatchDecision]) -> Option<MatchDecision> {
        let mut matches = judgments.iter().filter(|d| d.verdict == MatchVerdict::Match);
        match self {
            AcceptancePolicy::FirstMatch => matches.next().cloned(),
            AcceptancePolicy::HighestConfidence => matches
                .fold(None::<&MatchDecision>, |best, d| match best {
                    Some(b) if b.confidence >= d.confidence => Some(b),
                    _ => Some(d),
                })
                .cloned(),
        }
    }
}

/// Everything the matcher did for one trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// The accepted decision; always has verdict `match`.
    pub accepted: Option<MatchDecision>,
    /// Every judgment obtained, in source-then-rank order.
    pub judgments: Vec<MatchDecision>,
    /// Sources whose search failed.
    pub degraded_sources: Vec<PublicationSource>,
    pub candidates: usize,
    /// Judgment calls that failed outright.
    pub failed_judgments: usize,
}

// ── Judgment schema ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum VerdictField {
    Match,
    NoMatch,
    Uncertain,
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum ConfidenceField {
    High,
    Medium,
    Low,
}

/// Whether a publication reports the given trial.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct Judgment {
    verdict: VerdictField,
    confidence: ConfidenceField,
    /// One or two sentences citing the evidence for the verdict.
    rationale: String,
}

const JUDGE_PROMPT: &str = "You decide whether a scientific publication reports results of a \
specific clinical trial. Answer `match` only when the publication is clearly about this trial \
(same intervention, condition, design and sponsor, or it cites the registry id). Answer `no_match` \
when it is clearly a different study, `uncertain` otherwise. Reply with one JSON object.";

fn judge_prompt(trial: &TrialStub, c: &PublicationCandidate, schema: &serde_json::Value) -> String {
    format!(
        "Trial {}\nTitle: {}\nSponsor: {}\nCondition: {}\nPhase: {}\nInterventions: {}\n\
         Start date: {}\n\nCandidate publication ({} #{})\nTitle: {}\nYear: {}\nAbstract: {}\n\n\
         Answer with JSON matching this schema:\n{}",
        trial.registry_id,
        trial.title,
        trial.sponsor_name,
        trial.condition.as_deref().unwrap_or("unknown"),
        trial.phase.as_deref().unwrap_or("unknown"),
        trial.interventions.join("; "),
        trial.start_date.map(|d| d.to_string()).unwrap_or_else(|| "unknown".into()),
        c.source.as_str(),
        c.rank,
        c.title,
        c.year.map(|y| y.to_string()).unwrap_or_else(|| "unknown".into()),
        c.abstract_text.as_deref().unwrap_or("not available"),
        schema,
    )
}

fn decision_from(trial_id: &str, c: &PublicationCandidate, raw: &str) -> MatchDecision {
    let (verdict, confidence, rationale) = match parse_structured::<Judgment>(raw) {
        Ok(j) => (
            match j.verdict {
                VerdictField::Match     => MatchVerdict::Match,
                VerdictField::NoMatch   => MatchVerdict::NoMatch,
                VerdictField::Uncertain => MatchVerdict::Uncertain,
            },
            match j.confidence {
                ConfidenceField::High   => MatchConfidence::High,
                ConfidenceField::Medium => MatchConfidence::Medium,
                ConfidenceField::Low    => MatchConfidence::Low,
            },
            j.rationale,
        ),
        Err(e) => (
            MatchVerdict::Uncertain,
            MatchConfidence::Low,
            format!("judgment could not be parsed: {e}"),
        ),
    };
    MatchDecision {
        trial_id: trial_id.to_string(),
        candidate_source: c.source,
        candidate_id: c.external_id.clone(),
        candidate_title: c.title.clone(),
        verdict,
        rationale,
        confidence,
    }
}

/// Drops repeated (source, external id) pairs and orders by source, then rank.
pub fn dedup_candidates(mut candidates: Vec<PublicationCandidate>) -> Vec<PublicationCandidate> {
    candidates.sort_by(|a, b| a.source.cmp(&b.source).then(a.rank.cmp(&b.rank)));
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert((c.source, c.external_id.clone())));
    candidates
}

// ── Matcher ──────────────────────────────────────────────────────────────────

pub struct PublicationMatcher {
    indices: Vec<Arc<dyn PublicationIndex>>,
    backend: Arc<dyn LlmBackend>,
    policy: AcceptancePolicy,
    top_k: usize,
    schema: serde_json::Value,
}

impl PublicationMatcher {
    pub fn new(indices: Vec<Arc<dyn PublicationIndex>>, backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            indices,
            backend,
            policy: AcceptancePolicy::default(),
            top_k: DEFAULT_TOP_K,
            schema: schema_for::<Judgment>(),
        }
    }

    pub fn with_policy(mut self, policy: AcceptancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    async fn judge(&self, ctx: &RunContext, trial: &TrialStub, c: &PublicationCandidate) -> Option<MatchDecision> {
        let mut req = LlmRequest::new(vec![
            Message::system(JUDGE_PROMPT),
            Message::user(judge_prompt(trial, c, &self.schema)),
        ])
        .with_schema("publication_judgment", self.schema.clone());
        req.temperature = Some(0.0);
        req.max_tokens = Some(400);

        match ctx
            .complete(self.backend.as_ref(), &trial.registry_id, CallPurpose::PublicationJudgment, req)
            .await
        {
            Ok(resp) => Some(decision_from(&trial.registry_id, c, &resp.content)),
            Err(e) => {
                warn!(candidate = %c.external_id, source = c.source.as_str(), error = %e, "judgment call failed");
                None
            }
        }
    }

    /// Retrieves candidates from every index concurrently, judges each one
    /// and applies the acceptance policy.
    #[instrument(skip(self, ctx, trial), fields(trial_id = %trial.registry_id))]
    pub async fn match_trial(&self, ctx: &RunContext, trial: &TrialStub) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        if trial.title.trim().is_empty() {
            debug!("trial has no title, nothing to search for");
            return outcome;
        }

        let searches = self.indices.iter().map(|index| async move {
            (index.source(), index.search(&ctx.caller, &trial.title, self.top_k).await)
        });

        let mut pool = Vec::new();
        for (source, result) in join_all(searches).await {
            match result {
                Ok(found) => pool.extend(found.into_iter().take(self.top_k)),
                Err(e) => {
                    warn!(source = source.as_str(), error = %e, "publication source degraded");
                    outcome.degraded_sources.push(source);
                }
            }
        }

        let candidates = dedup_candidates(pool);
        outcome.candidates = candidates.len();

        let judgments = join_all(candidates.iter().map(|c| self.judge(ctx, trial, c))).await;
        for judgment in judgments {
            match judgment {
                Some(d) => outcome.judgments.push(d),
                None => outcome.failed_judgments += 1,
            }
        }

        outcome.accepted = self.policy.select(&outcome.judgments);
        info!(
            candidates = outcome.candidates,
            judged = outcome.judgments.len(),
            accepted = outcome.accepted.is_some(),
            "publication matching complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(source: PublicationSource, id: &str, rank: usize) -> PublicationCandidate {
        PublicationCandidate {
            source,
            external_id: id.into(),
            title: format!("Paper {id}"),
            abstract_text: None,
            rank,
            doi: None,
            year: None,
        }
    }

    fn decision(id: &str, verdict: MatchVerdict, confidence: MatchConfidence) -> MatchDecision {
        MatchDecision {
            trial_id: "NCT1".into(),
            candidate_source: PublicationSource::CrossRef,
            candidate_id: id.into(),
            candidate_title: id.into(),
            verdict,
            rationale: String::new(),
            confidence,
        }
    }

    #[test]
    fn test_dedup_candidates_orders_by_source_then_rank() {
        let out = dedup_candidates(vec![
            candidate(PublicationSource::OpenAlex, "W1", 1),
            candidate(PublicationSource::CrossRef, "10.1/b", 2),
            candidate(PublicationSource::CrossRef, "10.1/a", 1),
            candidate(PublicationSource::CrossRef, "10.1/a", 3),
        ]);
        let ids: Vec<_> = out.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["10.1/a", "10.1/b", "W1"]);
    }

    #[test]
    fn test_first_match_policy() {
        let js = vec![
            decision("a", MatchVerdict::NoMatch, MatchConfidence::High),
            decision("b", MatchVerdict::Match, MatchConfidence::Low),
            decision("c", MatchVerdict::Match, MatchConfidence::High),
        ];
        assert_eq!(AcceptancePolicy::FirstMatch.select(&js).unwrap().candidate_id, "b");
        assert_eq!(AcceptancePolicy::HighestConfidence.select(&js).unwrap().candidate_id, "c");
    }

    #[test]
    fn test_no_match_selects_nothing() {
        let js = vec![
            decision("a", MatchVerdict::NoMatch, MatchConfidence::High),
            decision("b", MatchVerdict::Uncertain, MatchConfidence::Medium),
        ];
        assert!(AcceptancePolicy::FirstMatch.select(&js).is_none());
        assert!(AcceptancePolicy::HighestConfidence.select(&js).is_none());
    }

    #[test]
    fn test_unparseable_judgment_is_uncertain() {
        let c = candidate(PublicationSource::PubMed, "123", 1);
        let d = decision_from("NCT1", &c, "Looks like a match to me!");
        assert_eq!(d.verdict, MatchVerdict::Uncertain);
        assert_eq!(d.confidence, MatchConfidence::Low);
    }

    #[test]
    fn test_parsed_judgment() {
        let c = candidate(PublicationSource::PubMed, "123", 1);
        let raw = r#"{"verdict": "match", "confidence": "high", "rationale": "Cites NCT1."}"#;
        let d = decision_from("NCT1", &c, raw);
        assert_eq!(d.verdict, MatchVerdict::Match);
        assert_eq!(d.candidate_source, PublicationSource::PubMed);
        assert_eq!(d.rationale, "Cites NCT1.");
    }
}
