//! MEXC-specific error types

use thiserror::Error;

use crate::error::BreakerError;

#[derive(Debug, Error)]
pub enum MexcError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result of a breaker-protected MEXC call
pub type MexcResult<T> = Result<T, BreakerError<MexcError>>;
