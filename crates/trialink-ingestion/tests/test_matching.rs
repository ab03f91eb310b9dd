//! Publication matching against scripted indices and judge.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use trialink_common::{MatchConfidence, MatchVerdict, PublicationSource};
use trialink_ingestion::caller::RetryPolicy;
use trialink_ingestion::{AcceptancePolicy, PublicationMatcher, RunContext};
use trialink_test_utils::{candidate, judgment_json, trial_stub, FakeIndex, ScriptedLlm};

fn ctx() -> RunContext {
    RunContext::new(RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_transient_attempts: 1,
        jitter: Duration::ZERO,
        requests_per_second: None,
        ..Default::default()
    })
}

/// Judges by candidate title: "Match high ..." → match/high and so on.
fn judge_by_title() -> ScriptedLlm {
    ScriptedLlm::new(|req| {
        let prompt = &req.messages[1].content;
        let reply = if prompt.contains("Title: Match high") {
            judgment_json("match", "high")
        } else if prompt.contains("Title: Match low") {
            judgment_json("match", "low")
        } else if prompt.contains("Title: Unsure") {
            judgment_json("uncertain", "medium")
        } else {
            judgment_json("no_match", "high")
        };
        Ok(reply)
    })
}

fn indices() -> Vec<Arc<dyn trialink_ingestion::sources::PublicationIndex>> {
    vec![
        FakeIndex::new(
            PublicationSource::OpenAlex,
            vec![candidate(PublicationSource::OpenAlex, "W1", "Match high confidence paper", 1)],
        )
        .shared(),
        FakeIndex::new(
            PublicationSource::CrossRef,
            vec![
                candidate(PublicationSource::CrossRef, "10.1/a", "Unrelated paper", 1),
                candidate(PublicationSource::CrossRef, "10.1/b", "Match low confidence paper", 2),
                candidate(PublicationSource::CrossRef, "10.1/c", "Unsure paper", 3),
            ],
        )
        .shared(),
    ]
}

#[tokio::test]
async fn test_first_match_in_source_then_rank_order() {
    let matcher = PublicationMatcher::new(indices(), Arc::new(judge_by_title()));
    let trial = trial_stub("NCT00000001", "Acme Biotech", "Some trial title long enough");
    let outcome = matcher.match_trial(&ctx(), &trial).await;

    assert_eq!(outcome.candidates, 4);
    assert_eq!(outcome.judgments.len(), 4);
    let accepted = outcome.accepted.unwrap();
    // CrossRef sorts before OpenAlex.
    assert_eq!(accepted.candidate_id, "10.1/b");
    assert_eq!(accepted.verdict, MatchVerdict::Match);
    assert_eq!(accepted.confidence, MatchConfidence::Low);
}

#[tokio::test]
async fn test_highest_confidence_policy() {
    let matcher = PublicationMatcher::new(indices(), Arc::new(judge_by_title()))
        .with_policy(AcceptancePolicy::HighestConfidence);
    let trial = trial_stub("NCT00000001", "Acme Biotech", "Some trial title long enough");
    let accepted = matcher.match_trial(&ctx(), &trial).await.accepted.unwrap();

    assert_eq!(accepted.candidate_id, "W1");
    assert_eq!(accepted.confidence, MatchConfidence::High);
}

#[tokio::test]
async fn test_top_k_limits_candidates_per_source() {
    let llm = Arc::new(judge_by_title());
    let matcher = PublicationMatcher::new(indices(), llm.clone()).with_top_k(1);
    let trial = trial_stub("NCT00000001", "Acme Biotech", "Some trial title long enough");
    let outcome = matcher.match_trial(&ctx(), &trial).await;

    assert_eq!(outcome.candidates, 2);
    assert_eq!(llm.judgment_calls(), 2);
    assert_eq!(outcome.accepted.unwrap().candidate_id, "W1");
}

#[tokio::test]
async fn test_failed_judgments_are_counted() {
    let matcher = PublicationMatcher::new(indices(), Arc::new(ScriptedLlm::failing(400)));
    let trial = trial_stub("NCT00000001", "Acme Biotech", "Some trial title long enough");
    let outcome = matcher.match_trial(&ctx(), &trial).await;

    assert_eq!(outcome.failed_judgments, 4);
    assert!(outcome.judgments.is_empty());
    assert!(outcome.accepted.is_none());
}

#[tokio::test]
async fn test_all_sources_down_yields_empty_outcome() {
    let matcher = PublicationMatcher::new(
        vec![
            FakeIndex::failing(PublicationSource::PubMed).shared(),
            FakeIndex::failing(PublicationSource::OpenAlex).shared(),
        ],
        Arc::new(judge_by_title()),
    );
    let trial = trial_stub("NCT00000001", "Acme Biotech", "Some trial title long enough");
    let outcome = matcher.match_trial(&ctx(), &trial).await;

    assert_eq!(outcome.degraded_sources, vec![PublicationSource::PubMed, PublicationSource::OpenAlex]);
    assert_eq!(outcome.candidates, 0);
    assert!(outcome.accepted.is_none());
}
