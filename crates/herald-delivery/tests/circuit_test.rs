//! Integration tests for the circuit breaker lifecycle.
//!
//! Walks a breaker through closed, open, half-open and back under a manual
//! clock, with real per-call timeouts driven by paused tokio time.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use herald_core::time::{Clock, TestClock};
use herald_delivery::{CircuitBreaker, CircuitConfig, CircuitState, DeliveryError, ErrorKind};

fn breaker(clock: &TestClock) -> CircuitBreaker {
    let config = CircuitConfig {
        failure_threshold: 3,
        timeout: Duration::from_millis(1000),
        reset_timeout: Duration::from_millis(5000),
        ..CircuitConfig::default()
    };
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    CircuitBreaker::new("sms-gateway", config, shared)
}

async fn hang(breaker: &CircuitBreaker) {
    let outcome = breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DeliveryError>(())
        })
        .await;
    assert!(outcome.metadata.timed_out);
    assert_eq!(outcome.result.expect_err("timed out").kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn timeouts_open_the_circuit_until_the_reset_window_passes() {
    let clock = TestClock::new();
    let breaker = breaker(&clock);
    let invoked = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        hang(&breaker).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    clock.advance(Duration::from_millis(4000));
    let counter = invoked.clone();
    let rejected = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DeliveryError>(())
        })
        .await;
    assert!(rejected.metadata.rejected);
    assert_eq!(
        rejected.result.expect_err("still open"),
        DeliveryError::CircuitOpen { resource: "sms-gateway".to_string(), retry_after_ms: 1000 }
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_millis(2000));
    let counter = invoked.clone();
    let trial = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DeliveryError>("delivered")
        })
        .await;
    assert!(trial.metadata.trial);
    assert_eq!(trial.result.expect("trial succeeds"), "delivered");
    assert_eq!(trial.circuit_state, CircuitState::Closed);
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let health = breaker.health().await;
    assert_eq!(health.total_opens, 1);
    assert_eq!(health.total_rejections, 1);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn caller_errors_pass_through_without_opening() {
    let clock = TestClock::new();
    let breaker = breaker(&clock);

    for _ in 0..10 {
        let outcome = breaker
            .call(|| async { Err::<(), _>(DeliveryError::validation("empty message body")) })
            .await;
        assert!(!outcome.metadata.counted_failure);
        assert_eq!(outcome.result.expect_err("invalid").kind(), ErrorKind::Validation);
    }

    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.health().await.total_failures, 0);
}

#[tokio::test]
async fn custom_predicate_decides_what_counts() {
    let clock = TestClock::new();
    let config = CircuitConfig { failure_threshold: 2, ..CircuitConfig::for_store() }
        .with_failure_predicate(|err| matches!(err, DeliveryError::Store { .. }));
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let breaker = CircuitBreaker::new("delivery-store", config, shared);

    for _ in 0..3 {
        breaker.call(|| async { Err::<(), _>(DeliveryError::connection("reset")) }).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);

    for _ in 0..2 {
        breaker.call(|| async { Err::<(), _>(DeliveryError::store("pool exhausted")) }).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
}

#[tokio::test]
async fn concurrent_callers_share_one_breaker() {
    let clock = TestClock::new();
    let breaker = Arc::new(breaker(&clock));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async { Err::<(), _>(DeliveryError::provider(Some(500), "boom")) })
                    .await
                    .metadata
            })
        })
        .collect();

    let mut executed: u64 = 0;
    for handle in handles {
        if !handle.await.expect("task").rejected {
            executed += 1;
        }
    }

    assert!(executed >= 3);
    assert_eq!(breaker.state().await, CircuitState::Open);
    let health = breaker.health().await;
    assert_eq!(health.total_opens, 1);
    assert_eq!(executed + health.total_rejections, 8);
}
