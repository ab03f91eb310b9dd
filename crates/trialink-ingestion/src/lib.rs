//! trialink-ingestion — Trial-to-evidence resolution pipeline.
//! - Registry, filing archive and publication index clients
//! - Rate-limited, retrying request execution shared per run
//! - Sponsor public-status verification with a run-scoped verdict cache
//! - Mention extraction from filing text
//! - LLM metadata enrichment and publication matching
//! - Record assembly and persistence

pub mod sources;
pub mod caller;
pub mod context;
pub mod normalise;
pub mod verifier;
pub mod extractor;
pub mod enricher;
pub mod matcher;
pub mod assembler;
pub mod pipeline;

pub use caller::{CallError, CallResult, RateLimitedCaller, RetryPolicy};
pub use context::RunContext;
pub use enricher::{EnricherConfig, MetadataEnricher};
pub use extractor::{ExtractorConfig, MentionExtractor};
pub use matcher::{AcceptancePolicy, MatchOutcome, PublicationMatcher};
pub use pipeline::{PipelineConfig, RunProgress, RunReport, TrialOutcome, TrialPipeline};
pub use verifier::{SponsorVerifier, VerdictCache};
