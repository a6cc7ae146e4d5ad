//! Error types for the rate limiter and circuit breaker
//!
//! A quota denial is normally a [`ConsumeResult`](crate::common::ConsumeResult),
//! not an error. [`Error::QuotaExceeded`] exists for call sites that prefer
//! `?` over inspecting the decision.

use thiserror::Error;

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("rate limit exceeded: {remaining}/{limit} points left, retry in {retry_after_ms}ms")]
    QuotaExceeded {
        limit: u32,
        remaining: u32,
        retry_after_ms: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure talking to the quota store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    #[error("rate limit store returned a malformed reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// The breaker rejected a call without running it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "circuit breaker '{breaker}' is OPEN, retry in {retry_after_secs}s (last error: {})",
    last_error.as_deref().unwrap_or("unknown")
)]
pub struct CircuitOpenError {
    pub breaker: String,
    pub retry_after_secs: u64,
    pub last_error: Option<String>,
}

/// Outcome of a failed [`CircuitBreaker::execute`](crate::common::CircuitBreaker::execute)
///
/// `Upstream` carries the wrapped operation's own error untouched.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Upstream(E),
}

impl<E> BreakerError<E> {
    /// True when the call never reached the dependency
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn upstream(self) -> Option<E> {
        match self {
            Self::Upstream(err) => Some(err),
            Self::Open(_) => None,
        }
    }

    pub fn circuit_open(&self) -> Option<&CircuitOpenError> {
        match self {
            Self::Open(err) => Some(err),
            Self::Upstream(_) => None,
        }
    }
}
