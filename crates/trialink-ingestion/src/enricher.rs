//! Schema-constrained metadata extraction from mention windows.
//!
//! The model is a best-effort field extractor behind three gates:
//!   1. schema: output must deserialize into [`ExtractedFields`]
//!   2. validation: names non-empty, `lower <= average <= upper`
//!   3. grounding: drug fields and numbers absent from the evidence are nulled
//!
//! A failure at gate 1 or 2 earns exactly one repair round carrying the error.

use std::sync::Arc;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use trialink_common::{
    Arm, BaselineMeasure, Endpoint, EnrichedMetadata, MentionWindow, TrialStub, ValidationStatus,
};
use trialink_llm::{parse_structured, schema_for, CallPurpose, LlmBackend, LlmRequest, Message};

use crate::context::RunContext;
use crate::extractor::sort_by_priority;

// ── Schema ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArmField {
    Intervention,
    Placebo,
    Other,
}

impl From<ArmField> for Arm {
    fn from(a: ArmField) -> Self {
        match a {
            ArmField::Intervention => Arm::Intervention,
            ArmField::Placebo      => Arm::Placebo,
            ArmField::Other        => Arm::Other,
        }
    }
}

/// One reported outcome measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EndpointField {
    pub name: String,
    pub description: Option<String>,
    /// e.g. "week 72"
    pub timepoint: Option<String>,
    pub arm: ArmField,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
    pub is_significant: Option<bool>,
}

/// One baseline characteristic of the enrolled population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BaselineField {
    pub name: String,
    pub description: Option<String>,
    pub arm: ArmField,
    pub average: Option<f64>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
}

/// Fields the model is asked to fill. Unknown values must be null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFields {
    pub drug_name: Option<String>,
    pub dose: Option<String>,
    pub frequency: Option<String>,
    pub formulation: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointField>,
    #[serde(default)]
    pub baseline_measures: Vec<BaselineField>,
}

// ── Validation ───────────────────────────────────────────────────────────────

fn check_bounds(what: &str, lower: Option<f64>, average: Option<f64>, upper: Option<f64>) -> Result<(), String> {
    let values = [lower, average, upper];
    if values.iter().flatten().any(|v| !v.is_finite()) {
        return Err(format!("{what}: values must be finite numbers"));
    }
    let ordered: Vec<f64> = values.into_iter().flatten().collect();
    if ordered.windows(2).any(|w| w[0] > w[1]) {
        return Err(format!("{what}: expected lower <= average <= upper"));
    }
    Ok(())
}

/// Semantic checks the schema cannot express.
pub fn validate(fields: &ExtractedFields) -> Result<(), String> {
    for (i, e) in fields.endpoints.iter().enumerate() {
        if e.name.trim().is_empty() {
            return Err(format!("endpoints[{i}].name is empty"));
        }
        check_bounds(&format!("endpoints[{i}]"), e.lower, e.average, e.upper)?;
    }
    for (i, b) in fields.baseline_measures.iter().enumerate() {
        if b.name.trim().is_empty() {
            return Err(format!("baseline_measures[{i}].name is empty"));
        }
        check_bounds(&format!("baseline_measures[{i}]"), b.lower, b.average, b.upper)?;
    }
    Ok(())
}

fn parse_and_validate(raw: &str) -> Result<ExtractedFields, String> {
    let fields: ExtractedFields = parse_structured(raw).map_err(|e| e.to_string())?;
    validate(&fields)?;
    Ok(fields)
}

// ── Grounding ────────────────────────────────────────────────────────────────

/// Text the model was shown, lowercased with whitespace collapsed.
struct Evidence {
    text: String,
    numbers: Vec<f64>,
}

impl Evidence {
    fn new(windows: &[&MentionWindow]) -> Self {
        let joined = windows.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
        let text = joined.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        Self { numbers: numbers_in(&joined), text }
    }

    fn mentions(&self, value: &str) -> bool {
        let needle = value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        !needle.is_empty() && self.text.contains(&needle)
    }

    fn has_number(&self, v: f64) -> bool {
        self.numbers.iter().any(|n| (n - v).abs() < 1e-9 || (n.abs() - v.abs()).abs() < 1e-9)
    }

    fn ground_str(&self, v: Option<String>) -> Option<String> {
        v.filter(|s| self.mentions(s))
    }

    fn ground_num(&self, v: Option<f64>) -> Option<f64> {
        v.filter(|n| self.has_number(*n))
    }
}

fn numbers_in(text: &str) -> Vec<f64> {
    // Thousands separators are dropped before parsing: "1,234.5" -> 1234.5
    let Ok(re) = Regex::new(r"-?\d{1,3}(?:,\d{3})+(?:\.\d+)?|-?\d+(?:\.\d+)?") else {
        return Vec::new();
    };
    re.find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

/// Nulls every value that does not occur in the evidence text.
fn ground(fields: ExtractedFields, evidence: &Evidence) -> ExtractedFields {
    let dropped_drug = fields.drug_name.as_ref().is_some_and(|d| !evidence.mentions(d));
    if dropped_drug {
        debug!("drug name not found in evidence, nulled");
    }
    ExtractedFields {
        drug_name:   evidence.ground_str(fields.drug_name),
        dose:        evidence.ground_str(fields.dose),
        frequency:   evidence.ground_str(fields.frequency),
        formulation: evidence.ground_str(fields.formulation),
        endpoints: fields.endpoints.into_iter().map(|e| EndpointField {
            average: evidence.ground_num(e.average),
            upper:   evidence.ground_num(e.upper),
            lower:   evidence.ground_num(e.lower),
            ..e
        }).collect(),
        baseline_measures: fields.baseline_measures.into_iter().map(|b| BaselineField {
            average: evidence.ground_num(b.average),
            upper:   evidence.ground_num(b.upper),
            lower:   evidence.ground_num(b.lower),
            ..b
        }).collect(),
    }
}

fn into_metadata(
    trial_id: &str,
    fields: ExtractedFields,
    provenance: Vec<String>,
    validation_status: ValidationStatus,
) -> EnrichedMetadata {
    EnrichedMetadata {
        trial_id: trial_id.to_string(),
        drug_name: fields.drug_name,
        dose: fields.dose,
        frequency: fields.frequency,
        formulation: fields.formulation,
        endpoints: fields.endpoints.into_iter().map(|e| Endpoint {
            name: e.name,
            description: e.description,
            timepoint: e.timepoint,
            arm: e.arm.into(),
            average: e.average,
            upper: e.upper,
            lower: e.lower,
            is_significant: e.is_significant,
        }).collect(),
        baseline_measures: fields.baseline_measures.into_iter().map(|b| BaselineMeasure {
            name: b.name,
            description: b.description,
            arm: b.arm.into(),
            average: b.average,
            upper: b.upper,
            lower: b.lower,
        }).collect(),
        provenance,
        validation_status,
    }
}

// ── Prompt ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnricherConfig {
    /// Budget for the concatenated window text in the prompt.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_context_chars() -> usize { 24_000 }
fn default_max_tokens() -> u32 { 2048 }

impl Default for EnricherConfig {
    fn default() -> Self {
        Self { max_context_chars: default_max_context_chars(), max_tokens: default_max_tokens() }
    }
}

const SYSTEM_PROMPT: &str = "You extract clinical-trial facts from excerpts of securities filings. \
Use only the excerpts. Every value you report must appear in them; when a value is not stated, \
return null. Never estimate, convert or compute numbers. Answer with one JSON object and nothing else.";

/// Windows in priority order that fit the budget. The last one may be cut
/// short at a character boundary.
fn select_windows(windows: &[MentionWindow], budget: usize) -> Vec<MentionWindow> {
    let mut ordered = windows.to_vec();
    sort_by_priority(&mut ordered);

    let mut used = 0;
    let mut selected = Vec::new();
    for mut w in ordered {
        if used >= budget {
            break;
        }
        let room = budget - used;
        if w.text.len() > room {
            let mut cut = room;
            while !w.text.is_char_boundary(cut) {
                cut -= 1;
            }
            w.text.truncate(cut);
        }
        used += w.text.len();
        if !w.text.is_empty() {
            selected.push(w);
        }
    }
    selected
}

fn user_prompt(trial: &TrialStub, windows: &[MentionWindow], schema: &serde_json::Value) -> String {
    let mut prompt = format!(
        "Trial {}\nTitle: {}\nSponsor: {}\nCondition: {}\nPhase: {}\nInterventions: {}\n\n\
         Fill this JSON schema:\n{}\n\nExcerpts:\n",
        trial.registry_id,
        trial.title,
        trial.sponsor_name,
        trial.condition.as_deref().unwrap_or("unknown"),
        trial.phase.as_deref().unwrap_or("unknown"),
        trial.interventions.join("; "),
        schema,
    );
    for w in windows {
        prompt.push_str(&format!("[{} | {}]\n{}\n\n", w.id, w.keyword_class.as_str(), w.text));
    }
    prompt
}

// ── Enricher ─────────────────────────────────────────────────────────────────

pub struct MetadataEnricher {
    backend: Arc<dyn LlmBackend>,
    config: EnricherConfig,
    schema: serde_json::Value,
}

impl MetadataEnricher {
    pub fn new(backend: Arc<dyn LlmBackend>, config: EnricherConfig) -> Self {
        Self { backend, config, schema: schema_for::<ExtractedFields>() }
    }

    fn context_budget(&self) -> usize {
        // ~3 characters per token leaves room for the schema and the answer
        self.config
            .max_context_chars
            .min(self.backend.max_context_tokens().saturating_mul(3))
    }

    fn request(&self, messages: Vec<Message>) -> LlmRequest {
        let mut req = LlmRequest::new(messages).with_schema("trial_metadata", self.schema.clone());
        req.max_tokens = Some(self.config.max_tokens);
        req.temperature = Some(0.0);
        req
    }

    /// Structured metadata for `trial` from its mention windows. Never fails:
    /// LLM or validation failures produce `rejected` all-null metadata.
    #[instrument(skip(self, ctx, trial, windows), fields(trial_id = %trial.registry_id, windows = windows.len()))]
    pub async fn enrich(
        &self,
        ctx: &RunContext,
        trial: &TrialStub,
        windows: &[MentionWindow],
    ) -> EnrichedMetadata {
        if windows.is_empty() {
            debug!("no mention windows, skipping LLM call");
            return EnrichedMetadata::empty(&trial.registry_id);
        }

        let selected = select_windows(windows, self.context_budget());
        let provenance: Vec<String> = selected.iter().map(|w| w.id.clone()).collect();
        let evidence = Evidence::new(&selected.iter().collect::<Vec<_>>());

        let mut messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(user_prompt(trial, &selected, &self.schema)),
        ];

        let first = match ctx
            .complete(self.backend.as_ref(), &trial.registry_id, CallPurpose::Enrichment, self.request(messages.clone()))
            .await
        {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(error = %e, "enrichment call failed");
                return EnrichedMetadata::rejected(&trial.registry_id, provenance);
            }
        };

        let error = match parse_and_validate(&first) {
            Ok(fields) => {
                return into_metadata(&trial.registry_id, ground(fields, &evidence), provenance, ValidationStatus::Valid);
            }
            Err(error) => error,
        };

        info!(%error, "enrichment output invalid, requesting repair");
        messages.push(Message::assistant(first));
        messages.push(Message::user(format!(
            "That answer was invalid: {error}. Reply again with a single JSON object that \
             conforms to the schema. Use null for anything the excerpts do not state."
        )));

        let second = match ctx
            .complete(self.backend.as_ref(), &trial.registry_id, CallPurpose::EnrichmentRepair, self.request(messages))
            .await
        {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(error = %e, "repair call failed");
                return EnrichedMetadata::rejected(&trial.registry_id, provenance);
            }
        };

        match parse_and_validate(&second) {
            Ok(fields) => {
                into_metadata(&trial.registry_id, ground(fields, &evidence), provenance, ValidationStatus::Repaired)
            }
            Err(error) => {
                warn!(%error, "repaired output still invalid, rejecting field set");
                EnrichedMetadata::rejected(&trial.registry_id, provenance)
            }
        }
    }
}
