//! Schema-constrained output parsing.
//!
//! Models wrap JSON in code fences or prose often enough that we always
//! locate the outermost object first, then deserialize it strictly.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StructuredError {
    #[error("no JSON object found in model output")]
    NoJson,
    #[error("output does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}

/// JSON schema for `T`, as sent in `LlmRequest::response_schema`.
pub fn schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
}

/// Returns the outermost `{ … }` slice of `raw`, ignoring code fences.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, StructuredError> {
    let json = extract_json(raw).ok_or(StructuredError::NoJson)?;
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Judgment {
        verdict: String,
        confidence: String,
    }

    #[test]
    fn test_parses_fenced_json() {
        let raw = "```json\n{\"verdict\": \"match\", \"confidence\": \"high\"}\n```";
        let j: Judgment = parse_structured(raw).unwrap();
        assert_eq!(j.verdict, "match");
    }

    #[test]
    fn test_prose_without_object_is_no_json() {
        let err = parse_structured::<Judgment>("I think it matches.").unwrap_err();
        assert!(matches!(err, StructuredError::NoJson));
    }

    #[test]
    fn test_missing_field_is_schema_error() {
        let err = parse_structured::<Judgment>("{\"verdict\": \"match\"}").unwrap_err();
        assert!(matches!(err, StructuredError::Schema(_)));
    }

    #[test]
    fn test_schema_for_lists_properties() {
        let schema = schema_for::<Judgment>();
        assert!(schema["properties"]["verdict"].is_object());
        assert!(schema["properties"]["confidence"].is_object());
    }
}
