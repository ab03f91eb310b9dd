//! trialink-llm — LLM backend abstraction layer.
//! The pipeline treats every backend as an untrusted oracle: requests can
//! carry a JSON schema, and `structured` turns raw completions into typed
//! values or a parse error the caller can repair against.

pub mod backend;
pub mod structured;
pub mod audit;

pub use backend::{LlmBackend, LlmError, LlmRequest, LlmResponse, Message};
pub use structured::{parse_structured, schema_for, StructuredError};
pub use audit::{CallPurpose, LlmAuditEntry};
