//! Scripted stand-ins for every external collaborator of the pipeline,
//! plus fixtures for the records they exchange.
//!
//! Every fake counts its calls so tests can assert on how often the
//! pipeline reached out.

pub mod fakes;
pub mod fixtures;

pub use fakes::{
    FakeFilingContent, FakeFilingSearch, FakeIndex, FakeRegistry, ScriptedLlm, JUDGMENT_SCHEMA,
};
pub use fixtures::{candidate, filing, judgment_json, trial_stub, trial_stub_with};
