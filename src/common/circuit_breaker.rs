//! Circuit Breaker pattern implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by temporarily
//! stopping requests to a failing service.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is failing, requests are rejected
//! - HalfOpen: One trial request probes whether the service has recovered
//!
//! Transitions are evaluated lazily when a call arrives; there is no
//! background timer. The Open -> HalfOpen transition and the grant of the
//! single trial happen under one lock, and while the trial is in flight
//! every other caller is rejected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{BreakerError, CircuitOpenError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    #[default]
    Closed,
    /// Service is failing - requests are rejected immediately
    Open,
    /// Testing if service has recovered - a single trial is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to stay in Open state before a trial is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with custom failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new configuration with custom reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Counters for observability. Only [`CircuitBreaker::clear_stats`] resets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls rejected without reaching the dependency
    pub rejected_requests: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`CircuitBreaker::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// When the next trial will be let through (Open only)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub trial_in_flight: bool,
    pub stats: BreakerStats,
}

#[derive(Debug, Default)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Ticket of the outstanding HalfOpen trial
    trial: Option<u64>,
    next_ticket: u64,
    stats: BreakerStats,
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial(u64),
}

/// Circuit breaker guarding one external call site
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trading_guard::common::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// #[tokio::main]
/// async fn main() {
///     let config = CircuitBreakerConfig::default()
///         .with_failure_threshold(2)
///         .with_reset_timeout(Duration::from_secs(30));
///     let cb = CircuitBreaker::new("mexc", config);
///
///     for _ in 0..2 {
///         let _ = cb.execute(|| async { Err::<(), _>("exchange down") }).await;
///     }
///     assert_eq!(cb.state(), CircuitState::Open);
///
///     let rejected = cb.execute(|| async { Ok::<_, String>(1) }).await;
///     assert!(rejected.unwrap_err().is_circuit_open());
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping never panics mid-update, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Check if the circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if the circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Run `operation` under the breaker
    ///
    /// Returns the operation's value unchanged on success. A call rejected
    /// by an open circuit yields [`BreakerError::Open`] and `operation` is
    /// never invoked. A failing operation is recorded and its error is
    /// handed back as [`BreakerError::Upstream`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut permit = Permit {
            breaker: self,
            admission: self.admit()?,
            settled: false,
        };

        match operation().await {
            Ok(value) => {
                permit.settled = true;
                self.on_success(permit.admission);
                Ok(value)
            }
            Err(e) => {
                permit.settled = true;
                self.on_failure(permit.admission, e.to_string());
                Err(BreakerError::Upstream(e))
            }
        }
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.lock();
        inner.stats.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                let retry_at = inner.opened_at.map(|at| at + self.config.reset_timeout);
                match retry_at {
                    Some(retry_at) if now < retry_at => {
                        inner.stats.rejected_requests += 1;
                        let wait_ms = retry_at.duration_since(now).as_millis() as u64;
                        Err(self.open_error(&inner, wait_ms.div_ceil(1000)))
                    }
                    _ => {
                        tracing::info!("Circuit breaker '{}' entering HALF_OPEN state", self.name);
                        inner.state = CircuitState::HalfOpen;
                        Ok(Self::grant_trial(&mut inner))
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_none() {
                    Ok(Self::grant_trial(&mut inner))
                } else {
                    inner.stats.rejected_requests += 1;
                    let wait_secs = (self.config.reset_timeout.as_millis() as u64).div_ceil(1000);
                    Err(self.open_error(&inner, wait_secs))
                }
            }
        }
    }

    fn grant_trial(inner: &mut Inner) -> Admission {
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.trial = Some(ticket);
        Admission::Trial(ticket)
    }

    fn open_error(&self, inner: &Inner, retry_after_secs: u64) -> CircuitOpenError {
        CircuitOpenError {
            breaker: self.name.clone(),
            retry_after_secs,
            last_error: inner.last_error.clone(),
        }
    }

    /// True when `admission` is the trial the breaker is waiting on
    fn is_current_trial(inner: &Inner, admission: Admission) -> bool {
        match admission {
            Admission::Trial(ticket) => {
                inner.state == CircuitState::HalfOpen && inner.trial == Some(ticket)
            }
            Admission::Normal => false,
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.stats.successful_requests += 1;
        inner.consecutive_failures = 0;

        if Self::is_current_trial(&inner, admission) {
            tracing::info!("Circuit breaker '{}' CLOSED (recovered)", self.name);
            inner.state = CircuitState::Closed;
            inner.trial = None;
            inner.opened_at = None;
            inner.opened_wall = None;
            inner.stats.closed_at = Some(Utc::now());
        }
    }

    fn on_failure(&self, admission: Admission, message: String) {
        let mut inner = self.lock();
        inner.stats.failed_requests += 1;
        inner.consecutive_failures += 1;
        tracing::warn!(
            "Circuit breaker '{}' failure {}/{}: {}",
            self.name,
            inner.consecutive_failures,
            self.config.failure_threshold,
            message
        );
        inner.last_error = Some(message);

        if Self::is_current_trial(&inner, admission) {
            inner.trial = None;
            tracing::warn!("Circuit breaker '{}' re-opened: trial call failed", self.name);
            self.open(&mut inner);
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut Inner) {
        let wall = Utc::now();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_wall = Some(wall);
        inner.stats.opened_at = Some(wall);
        tracing::error!(
            "Circuit breaker '{}' OPENED, will retry in {}s",
            self.name,
            (self.config.reset_timeout.as_millis() as u64).div_ceil(1000)
        );
    }

    /// Trial future dropped before it resolved: let the next caller probe
    fn release(&self, admission: Admission) {
        let mut inner = self.lock();
        if Self::is_current_trial(&inner, admission) {
            tracing::debug!("Circuit breaker '{}' trial abandoned", self.name);
            inner.trial = None;
        }
    }

    /// Read-only snapshot for health endpoints
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        let next_attempt_at = match inner.state {
            CircuitState::Open => inner.opened_wall.map(|at| {
                at + chrono::Duration::milliseconds(self.config.reset_timeout.as_millis() as i64)
            }),
            _ => None,
        };
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            next_attempt_at,
            last_error: inner.last_error.clone(),
            trial_in_flight: inner.trial.is_some(),
            stats: inner.stats.clone(),
        }
    }

    /// Force the circuit closed, bypassing the reset timeout. Stats are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_error = None;
        inner.opened_at = None;
        inner.opened_wall = None;
        inner.trial = None;
        tracing::info!("Circuit breaker '{}' manually reset", self.name);
    }

    /// Zero the observability counters
    pub fn clear_stats(&self) {
        self.lock().stats = BreakerStats::default();
    }
}

/// Admission held for the duration of one call
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}
