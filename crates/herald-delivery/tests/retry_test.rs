//! Integration tests for retry backoff.
//!
//! Property tests pin the backoff curve: non-decreasing, capped at
//! `max_delay`, and jitter confined to ±25% of the capped value.

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
use herald_delivery::{
    retry::{StopReason, JITTER_FACTOR},
    DeliveryError, RetryConfig, RetryManager,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 256,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn manager(config: RetryConfig) -> (RetryManager, TestClock) {
    let clock = TestClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (RetryManager::new(config, shared), clock)
}

fn policy_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u64..5_000, 1u64..120_000, 1.0f64..4.0).prop_map(|(initial_ms, extra_ms, multiplier)| {
        RetryConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(initial_ms + extra_ms),
            backoff_multiplier: multiplier,
            jitter_enabled: false,
            ..RetryConfig::default()
        }
    })
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn backoff_never_decreases_and_never_exceeds_cap(config in policy_strategy()) {
        let max_delay = config.max_delay;
        let (retry, _clock) = manager(config);

        let mut previous = Duration::ZERO;
        for retry_index in 0..40 {
            let delay = retry.backoff_delay(retry_index);
            prop_assert!(delay >= previous, "delay shrank at retry {}", retry_index);
            prop_assert!(delay <= max_delay);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_capped_delay(
        config in policy_strategy(),
        retry_index in 0u32..20
    ) {
        let (retry, _clock) =
            manager(RetryConfig { jitter_enabled: true, ..config });
        let base = retry.backoff_delay(retry_index).as_secs_f64();
        let error = DeliveryError::provider(Some(503), "unavailable");

        for _ in 0..20 {
            let jittered = retry.delay_for(retry_index, &error).as_secs_f64();
            prop_assert!(jittered >= base * (1.0 - JITTER_FACTOR) - 1e-6);
            prop_assert!(jittered <= base * (1.0 + JITTER_FACTOR) + 1e-6);
        }
    }
}

#[test]
fn default_policy_follows_documented_curve() {
    let (retry, _clock) = manager(RetryConfig { jitter_enabled: false, ..RetryConfig::default() });

    let delays: Vec<u64> =
        (0..6).map(|i| u64::try_from(retry.backoff_delay(i).as_millis()).unwrap()).collect();

    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
}

#[tokio::test]
async fn three_retries_mean_four_attempts_and_three_sleeps() {
    let (retry, clock) = manager(RetryConfig {
        max_retries: 3,
        jitter_enabled: false,
        ..RetryConfig::default()
    });
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = retry
        .execute(|| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DeliveryError::connection("connection refused"))
            }
        })
        .await;

    assert_eq!(outcome.attempts, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.stop_reason, StopReason::RetriesExhausted);
    assert_eq!(clock.total_slept(), Duration::from_secs(1 + 2 + 4));

    let delays: Vec<Option<Duration>> =
        outcome.attempt_details.iter().map(|detail| detail.delay).collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
            None
        ]
    );
}

#[tokio::test]
async fn rate_limit_hint_overrides_short_backoff() {
    let (retry, clock) = manager(RetryConfig {
        max_retries: 1,
        initial_delay: Duration::from_millis(100),
        jitter_enabled: false,
        ..RetryConfig::default()
    });
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = retry
        .execute(|| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DeliveryError::rate_limited(Some(Duration::from_secs(9))))
                } else {
                    Ok("accepted")
                }
            }
        })
        .await;

    assert_eq!(outcome.into_result().expect("second attempt succeeds"), "accepted");
    assert_eq!(clock.total_slept(), Duration::from_secs(9));
}
