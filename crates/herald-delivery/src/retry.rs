//! Bounded exponential backoff with jitter.
//!
//! [`RetryManager::execute`] re-runs an operation until it succeeds, fails
//! with a non-retriable error, runs out of retries, or hits the global
//! ceiling. Every attempt is recorded so callers can log and assert on the
//! exact backoff that was applied.
//!
//! Workers always nest the two resilience primitives as
//! `retry.execute(|| breaker.call(op))` so each retry re-checks the circuit.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use herald_core::time::Clock;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Jitter applied to each delay when enabled: ±25%.
pub const JITTER_FACTOR: f64 = 0.25;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&DeliveryError) -> bool + Send + Sync>;

/// Retry policy.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Randomize each delay by [`JITTER_FACTOR`].
    pub jitter_enabled: bool,
    /// Ceiling for the whole attempt sequence.
    pub global_timeout: Option<Duration>,
    /// Which errors are retried.
    pub is_retriable: RetryPredicate,
}

impl RetryConfig {
    /// Policy for provider sends: a handful of retries within two minutes.
    pub fn for_provider() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            global_timeout: Some(Duration::from_secs(120)),
            ..Self::default()
        }
    }

    /// Policy for store writes: quick, few retries.
    pub fn for_store() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            global_timeout: Some(Duration::from_secs(10)),
            ..Self::default()
        }
    }

    /// Replaces the retry predicate.
    #[must_use]
    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DeliveryError) -> bool + Send + Sync + 'static,
    {
        self.is_retriable = Arc::new(predicate);
        self
    }

    /// Checks the numeric invariants.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            return Err(DeliveryError::configuration("backoff_multiplier must be greater than 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(DeliveryError::configuration("max_delay must be at least initial_delay"));
        }
        if self.global_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(DeliveryError::configuration("global_timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            global_timeout: None,
            is_retriable: Arc::new(DeliveryError::is_retriable),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_enabled", &self.jitter_enabled)
            .field("global_timeout", &self.global_timeout)
            .finish_non_exhaustive()
    }
}

/// Why an attempt sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The operation succeeded.
    Succeeded,
    /// The last error was not retriable.
    NonRetriable,
    /// `max_retries` retries were used up.
    RetriesExhausted,
    /// The global ceiling was reached or the next delay would cross it.
    GlobalTimeout,
}

/// One attempt in a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptDetail {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error the attempt failed with, `None` on success.
    pub error: Option<DeliveryError>,
    /// Delay slept before the next attempt, `None` if there was none.
    pub delay: Option<Duration>,
    /// Time spent in the attempt.
    pub elapsed: Duration,
}

/// Result envelope of [`RetryManager::execute`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result.
    pub result: Result<T>,
    /// Attempts started.
    pub attempts: u32,
    /// Time from the first attempt to the final result.
    pub total_time: Duration,
    /// Per-attempt trace.
    pub attempt_details: Vec<AttemptDetail>,
    /// Why the sequence stopped.
    pub stop_reason: StopReason,
}

impl<T> RetryOutcome<T> {
    /// Returns true when the final attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Most recent attempt error, which survives a global timeout that
    /// replaces `result` with `DeliveryError::GlobalTimeout`.
    pub fn last_attempt_error(&self) -> Option<&DeliveryError> {
        self.attempt_details.iter().rev().find_map(|detail| detail.error.as_ref())
    }

    /// Discards the envelope.
    ///
    /// # Errors
    ///
    /// Returns the final error.
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

#[derive(Default)]
struct Trace {
    attempts: u32,
    details: Vec<AttemptDetail>,
    stop_reason: Option<StopReason>,
}

/// Stateless retry executor; one per channel, shared by its workers.
#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RetryManager {
    /// Creates a retry manager.
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Retry policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered delay before retry `retry_index` (0-based):
    /// `min(initial_delay * backoff_multiplier^retry_index, max_delay)`.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs =
            self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay actually slept before retry `retry_index` after `error`.
    ///
    /// Jitter is applied to the capped backoff; a provider or breaker hint
    /// raises the delay to at least the hinted wait.
    pub fn delay_for(&self, retry_index: u32, error: &DeliveryError) -> Duration {
        let base = self.backoff_delay(retry_index);
        let delay = if self.config.jitter_enabled { apply_jitter(base, JITTER_FACTOR) } else { base };

        match error.retry_hint() {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Runs `operation` with retries.
    ///
    /// Never returns early by panicking or hanging: the result envelope is
    /// produced within `global_timeout` when one is configured.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = self.clock.now();
        let mut trace = Trace::default();

        let result = match self.config.global_timeout {
            Some(limit) => {
                let bounded =
                    tokio::time::timeout(limit, self.run(&mut operation, &mut trace)).await;
                match bounded {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            attempts = trace.attempts,
                            global_timeout_ms = limit.as_millis() as u64,
                            "retry sequence hit global timeout"
                        );
                        trace.stop_reason = Some(StopReason::GlobalTimeout);
                        Err(DeliveryError::GlobalTimeout {
                            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            attempts: trace.attempts,
                        })
                    },
                }
            },
            None => self.run(&mut operation, &mut trace).await,
        };

        RetryOutcome {
            result,
            attempts: trace.attempts,
            total_time: self.clock.now().duration_since(started),
            attempt_details: trace.details,
            stop_reason: trace.stop_reason.unwrap_or(StopReason::RetriesExhausted),
        }
    }

    async fn run<T, F, Fut>(&self, operation: &mut F, trace: &mut Trace) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = self.clock.now();
        let mut retry_index = 0;

        loop {
            trace.attempts += 1;
            let attempt = trace.attempts;
            let attempt_started = self.clock.now();
            let result = operation().await;
            let elapsed = self.clock.now().duration_since(attempt_started);

            let error = match result {
                Ok(value) => {
                    trace.details.push(AttemptDetail { attempt, error: None, delay: None, elapsed });
                    trace.stop_reason = Some(StopReason::Succeeded);
                    return Ok(value);
                },
                Err(error) => error,
            };

            if !(self.config.is_retriable)(&error) {
                debug!(attempt, error = %error, kind = %error.kind(), "non-retriable error");
                trace.details.push(AttemptDetail {
                    attempt,
                    error: Some(error.clone()),
                    delay: None,
                    elapsed,
                });
                trace.stop_reason = Some(StopReason::NonRetriable);
                return Err(error);
            }

            if retry_index >= self.config.max_retries {
                debug!(attempt, error = %error, "retries exhausted");
                trace.details.push(AttemptDetail {
                    attempt,
                    error: Some(error.clone()),
                    delay: None,
                    elapsed,
                });
                trace.stop_reason = Some(StopReason::RetriesExhausted);
                return Err(error);
            }

            let delay = self.delay_for(retry_index, &error);
            if let Some(limit) = self.config.global_timeout {
                let spent = self.clock.now().duration_since(started);
                if spent + delay > limit {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "next retry would cross global timeout"
                    );
                    trace.details.push(AttemptDetail {
                        attempt,
                        error: Some(error.clone()),
                        delay: None,
                        elapsed,
                    });
                    trace.stop_reason = Some(StopReason::GlobalTimeout);
                    return Err(error);
                }
            }

            debug!(
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            trace.details.push(AttemptDetail {
                attempt,
                error: Some(error),
                delay: Some(delay),
                elapsed,
            });

            self.clock.sleep(delay).await;
            retry_index += 1;
        }
    }
}

/// Randomizes `duration` by ±`jitter_factor`. With a factor of 0.25 a 10s
/// delay becomes anything from 7.5s to 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
