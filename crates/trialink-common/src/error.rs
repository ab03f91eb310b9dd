use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrialinkError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocked by allowlist: {0}")]
    Security(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrialinkError>;
