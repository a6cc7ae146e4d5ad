//! Integration tests for the rate limiter and circuit breaker
//!
//! These tests drive the public API the way the API edge and the exchange
//! adapters use it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::advance;

use trading_guard::common::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ConsumptionRecord, Decision,
    FailureMode, InMemoryStore, LimiterConfig, RateLimitStore, RateLimiter, RateLimiterSet,
    StoreOutcome, WindowPolicy,
};
use trading_guard::ingress::{derive_key, Rejection, RouteCosts};
use trading_guard::{BreakerError, Error, StoreError};

// =============================================================================
// Test Utilities
// =============================================================================

fn limiter(points: u32, window_seconds: u64) -> RateLimiter {
    let config = LimiterConfig::default()
        .with_points(points)
        .with_window_seconds(window_seconds);
    RateLimiter::new(config, Arc::new(InMemoryStore::new())).unwrap()
}

fn breaker(threshold: u32, reset_timeout_ms: u64) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "exchange",
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout(Duration::from_millis(reset_timeout_ms)),
    ))
}

async fn failing_call(
    cb: &CircuitBreaker,
    calls: &AtomicUsize,
) -> Result<(), BreakerError<String>> {
    cb.execute(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("502 Bad Gateway".to_string())
    })
    .await
}

async fn succeeding_call(
    cb: &CircuitBreaker,
    calls: &AtomicUsize,
) -> Result<&'static str, BreakerError<String>> {
    cb.execute(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("ok")
    })
    .await
}

/// Store whose backend is down
struct UnreachableStore;

#[async_trait]
impl RateLimitStore for UnreachableStore {
    async fn consume(
        &self,
        _key: &str,
        _cost: u32,
        _policy: &WindowPolicy,
    ) -> Result<StoreOutcome, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &str) -> Result<Option<ConsumptionRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn backend(&self) -> &'static str {
        "unreachable"
    }
}

// =============================================================================
// Rate Limiter Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_allowed_count_never_exceeds_quota() {
    let limiter = limiter(7, 60);

    let mut allowed = 0;
    for _ in 0..100 {
        if limiter.consume("u1", 1).await.unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 7);
}

#[tokio::test(start_paused = true)]
async fn test_three_point_scenario() {
    let limiter = limiter(3, 60);

    let mut remaining = Vec::new();
    for _ in 0..3 {
        let result = limiter.consume("u1", 1).await.unwrap();
        assert!(result.is_allowed());
        remaining.push(result.remaining_points);
    }
    assert_eq!(remaining, vec![2, 1, 0]);

    let fourth = limiter.consume("u1", 1).await.unwrap();
    assert_eq!(fourth.decision, Decision::Denied);
    assert_eq!(fourth.remaining_points, 0);
}

#[tokio::test(start_paused = true)]
async fn test_window_restarts_after_window_seconds() {
    let limiter = limiter(10, 60);
    limiter.consume("u1", 10).await.unwrap();
    assert!(!limiter.consume("u1", 1).await.unwrap().is_allowed());

    advance(Duration::from_secs(59)).await;
    let still_denied = limiter.consume("u1", 1).await.unwrap();
    assert!(!still_denied.is_allowed());
    assert_eq!(still_denied.ms_before_next_window, 1_000);

    advance(Duration::from_secs(1)).await;
    let fresh = limiter.consume("u1", 3).await.unwrap();
    assert!(fresh.is_allowed());
    assert_eq!(fresh.remaining_points, 10 - 3);
}

#[tokio::test(start_paused = true)]
async fn test_keys_do_not_share_quota() {
    let limiter = limiter(2, 60);
    limiter.consume("user:1", 2).await.unwrap();

    assert!(!limiter.consume("user:1", 1).await.unwrap().is_allowed());
    assert!(limiter.consume("user:2", 1).await.unwrap().is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_half_quota_requests_never_double_grant() {
    for round in 0..20 {
        let limiter = limiter(10, 60);
        let key = format!("race:{}", round);

        let (a, b) = tokio::join!(
            {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.consume(&key, 6).await.unwrap() })
            },
            {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.consume(&key, 6).await.unwrap() })
            }
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.is_allowed(), b.is_allowed(), "exactly one must be granted");
        let status = limiter.status(&key).await.unwrap().unwrap();
        assert_eq!(status.consumed_points, 6);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_consumers_respect_quota() {
    let limiter = limiter(25, 60);

    let handles: Vec<_> = (0..200)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let result = limiter.consume("hot-key", 1).await.unwrap();
                result.is_allowed()
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 25);
}

#[tokio::test]
async fn test_fail_closed_denies_when_store_is_down() {
    let config = LimiterConfig::default()
        .with_points(5)
        .with_window_seconds(30)
        .with_failure_mode(FailureMode::FailClosed);
    let limiter = RateLimiter::new(config, Arc::new(UnreachableStore)).unwrap();

    let result = limiter.consume("u1", 1).await.unwrap();
    assert!(!result.is_allowed());
    assert!(result.degraded);
    assert_eq!(result.remaining_points, 0);
    assert_eq!(result.retry_after_secs(), 30);
}

#[tokio::test]
async fn test_fail_open_allows_when_store_is_down() {
    let config = LimiterConfig::default()
        .with_points(5)
        .with_failure_mode(FailureMode::FailOpen);
    let limiter = RateLimiter::new(config, Arc::new(UnreachableStore)).unwrap();

    let result = limiter.consume("u1", 1).await.unwrap();
    assert!(result.is_allowed());
    assert!(result.degraded);
    assert_eq!(result.remaining_points, 5);
}

#[tokio::test]
async fn test_failure_mode_override_per_call_site() {
    let limiter = RateLimiter::new(LimiterConfig::default(), Arc::new(UnreachableStore)).unwrap();

    // Mutating endpoint keeps the fail-closed default
    assert!(!limiter.consume("u1", 1).await.unwrap().is_allowed());
    // Health check opts into fail-open
    let health = limiter
        .consume_with("u1", 1, FailureMode::FailOpen)
        .await
        .unwrap();
    assert!(health.is_allowed());
}

#[tokio::test]
async fn test_admin_operations_surface_store_errors() {
    let limiter = RateLimiter::new(LimiterConfig::default(), Arc::new(UnreachableStore)).unwrap();

    assert!(matches!(
        limiter.status("u1").await,
        Err(Error::Store(StoreError::Unavailable(_)))
    ));
    assert!(matches!(limiter.reset("u1").await, Err(Error::Store(_))));
}

#[tokio::test(start_paused = true)]
async fn test_ingress_flow_with_route_costs() {
    let limiter = limiter(10, 60);
    let costs = RouteCosts::default().with_route("order_create", 4);
    let key = derive_key(Some("42"), Some("198.51.100.1"), None);

    for _ in 0..2 {
        let result = limiter.consume(&key, costs.cost_for("order_create")).await.unwrap();
        assert!(Rejection::from_quota(&result).is_none());
    }

    let result = limiter.consume(&key, costs.cost_for("order_create")).await.unwrap();
    let rejection = Rejection::from_quota(&result).unwrap();
    assert_eq!(rejection.status, 429);
    assert_eq!(rejection.body["retryAfter"], 60);
    assert!(rejection
        .headers
        .iter()
        .any(|(name, value)| *name == "X-RateLimit-Remaining" && value == "2"));

    // Cheap routes still fit into what is left
    let ticker = limiter.consume(&key, costs.cost_for("ticker")).await.unwrap();
    assert!(ticker.is_allowed());
    assert_eq!(ticker.remaining_points, 1);
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_classes_share_store_but_not_quota() {
    let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryStore::new());
    let limiters = RateLimiterSet::builder(
        LimiterConfig::default().with_points(30).with_key_prefix("mexc"),
        store.clone(),
    )
    .class("order_create", LimiterConfig::default().with_points(10))
    .class("ticker", LimiterConfig::default().with_points(60))
    .build()
    .unwrap();
    let key = derive_key(Some("42"), None, None);

    let mut orders = 0;
    for _ in 0..25 {
        let result = limiters.consume("order_create", &key, 1).await.unwrap();
        if result.is_allowed() {
            orders += 1;
        } else {
            let rejection = Rejection::from_quota(&result).unwrap();
            assert!(rejection
                .headers
                .contains(&("X-RateLimit-Limit", "10".to_string())));
        }
    }
    assert_eq!(orders, 10);

    let mut tickers = 0;
    for _ in 0..70 {
        let result = limiters.consume("ticker", &key, 1).await.unwrap();
        if result.is_allowed() {
            tickers += 1;
        }
    }
    assert_eq!(tickers, 60, "order quota must not leak into ticker quota");

    // One record per class, all in the same store
    let record = store.get("mexc:order_create:user:42").await.unwrap().unwrap();
    assert_eq!(record.points_consumed, 10);
    assert!(store.get("mexc:user:42").await.unwrap().is_none());
}

// =============================================================================
// Circuit Breaker Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_three_failures_trip_and_fourth_call_is_rejected() {
    let cb = breaker(3, 10_000);
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let err = failing_call(&cb, &calls).await.unwrap_err();
        assert!(!err.is_circuit_open());
    }
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = succeeding_call(&cb, &calls).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(err.circuit_open().unwrap().retry_after_secs, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "fn must not run while open");
}

#[tokio::test(start_paused = true)]
async fn test_two_failure_scenario() {
    let cb = breaker(2, 1000);
    let calls = AtomicUsize::new(0);

    failing_call(&cb, &calls).await.unwrap_err();
    failing_call(&cb, &calls).await.unwrap_err();
    assert_eq!(cb.state(), CircuitState::Open);

    let third = succeeding_call(&cb, &calls).await;
    assert!(matches!(third, Err(BreakerError::Open(_))));

    advance(Duration::from_millis(1000)).await;

    assert_eq!(succeeding_call(&cb, &calls).await.unwrap(), "ok");
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_with_fresh_timer() {
    let cb = breaker(1, 2000);
    let calls = AtomicUsize::new(0);
    failing_call(&cb, &calls).await.unwrap_err();
    let first_open = cb.status().stats.opened_at.unwrap();

    advance(Duration::from_millis(2000)).await;
    failing_call(&cb, &calls).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "trial invoked fn exactly once");
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(cb.status().stats.opened_at.unwrap() >= first_open);

    advance(Duration::from_millis(1500)).await;
    let err = succeeding_call(&cb, &calls).await.unwrap_err();
    assert_eq!(err.circuit_open().unwrap().retry_after_secs, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_a_single_trial() {
    let cb = breaker(1, 1000);
    let calls = Arc::new(AtomicUsize::new(0));
    failing_call(&cb, &calls).await.unwrap_err();
    advance(Duration::from_millis(1000)).await;

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let trial = {
        let cb = cb.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cb.execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
                Ok::<_, String>("recovered")
            })
            .await
        })
    };

    // Let the trial get admitted and park
    while !cb.status().trial_in_flight {
        tokio::task::yield_now().await;
    }
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    for _ in 0..5 {
        let err = succeeding_call(&cb, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2, "only the trial reached the dependency");

    release_tx.send(()).unwrap();
    assert_eq!(trial.await.unwrap().unwrap(), "recovered");
    assert_eq!(cb.state(), CircuitState::Closed);
    assert!(!cb.status().trial_in_flight);
    assert_eq!(cb.status().stats.rejected_requests, 5);
}

#[tokio::test(start_paused = true)]
async fn test_status_never_mutates() {
    let cb = breaker(1, 1000);
    let calls = AtomicUsize::new(0);
    failing_call(&cb, &calls).await.unwrap_err();

    // Even after the timeout, only a call moves the breaker to HALF_OPEN
    advance(Duration::from_millis(5000)).await;
    let snapshots: Vec<_> = (0..10).map(|_| cb.status()).collect();
    assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(snapshots[0].state, CircuitState::Open);
    assert_eq!(snapshots[0].stats.total_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reset_bypasses_timeout() {
    let cb = breaker(1, 60_000);
    let calls = AtomicUsize::new(0);
    failing_call(&cb, &calls).await.unwrap_err();
    assert!(cb.is_open());

    cb.reset();
    assert_eq!(succeeding_call(&cb, &calls).await.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_rejection_maps_to_503() {
    let cb = breaker(1, 4500);
    let calls = AtomicUsize::new(0);
    failing_call(&cb, &calls).await.unwrap_err();

    let err = succeeding_call(&cb, &calls).await.unwrap_err();
    let rejection = Rejection::from_circuit_open(err.circuit_open().unwrap());
    assert_eq!(rejection.status, 503);
    assert_eq!(rejection.headers, vec![("Retry-After", "5".to_string())]);
}
