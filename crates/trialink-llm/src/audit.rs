//! Audit trail for LLM calls made during a run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::backend::LlmResponse;

/// What an LLM call was made for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Enrichment,
    EnrichmentRepair,
    PublicationJudgment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAuditEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub trial_id: String,
    pub purpose: CallPurpose,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub output_hash: String,
    pub latency_ms: u64,
    pub called_at: chrono::DateTime<Utc>,
}

impl LlmAuditEntry {
    pub fn new(
        run_id: Uuid,
        trial_id: impl Into<String>,
        purpose: CallPurpose,
        response: &LlmResponse,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            trial_id: trial_id.into(),
            purpose,
            model: response.model.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            output_hash: output_hash(&response.content),
            latency_ms,
            called_at: Utc::now(),
        }
    }
}

pub fn output_hash(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_hashes_output() {
        let resp = LlmResponse {
            content: "{}".into(),
            model: "m".into(),
            prompt_tokens: 10,
            completion_tokens: 2,
        };
        let e = LlmAuditEntry::new(Uuid::new_v4(), "NCT00000001", CallPurpose::Enrichment, &resp, 5);
        assert_eq!(e.output_hash.len(), 64);
        assert_eq!(e.output_hash, output_hash("{}"));
        assert_eq!(e.trial_id, "NCT00000001");
    }
}
