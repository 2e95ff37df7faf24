//! Error types crossing the outward boundary of the review pipeline.
//!
//! Component internals use `anyhow` and absorb their own failures wherever a
//! fallback path exists. Only configuration violations, unavailable
//! required methods, and total failures surface as [`ReviewError`].

use thiserror::Error;

use crate::models::RetrievalMethod;

/// Main error type for review runs.
#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{method} search unavailable: {reason}")]
    MethodUnavailable {
        method: RetrievalMethod,
        reason: String,
    },

    #[error("Review failed: {0}")]
    TotalFailure(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for review operations.
pub type Result<T> = std::result::Result<T, ReviewError>;
