//! Circuit breaker protecting one channel or resource.
//!
//! Fails fast while a provider is down and lets a single trial call through
//! once the reset window has passed.
//!
//! # State Machine
//!
//! ```text
//!                     ┌──────────────────────────┐
//!                     │          CLOSED          │
//!                     │    (normal operation)    │
//!                     └──────────────────────────┘
//!                        │                     ▲
//!  failure_threshold     │                     │ trial succeeds
//!  consecutive failures  │                     │
//!                        ▼                     │
//!  ┌──────────────────────────┐   reset    ┌──────────────────────────┐
//!  │           OPEN           │  timeout   │        HALF-OPEN         │
//!  │  (reject without call)   │ ─────────▶ │  (exactly one trial)     │
//!  └──────────────────────────┘            └──────────────────────────┘
//!                        ▲                     │
//!                        └─────────────────────┘
//!                            trial fails
//! ```
//!
//! The lock only guards bookkeeping. The protected operation runs outside
//! it, raced against `CircuitConfig::timeout`.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::time::RealClock;
//! use herald_delivery::circuit::{CircuitBreaker, CircuitConfig};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("sms", CircuitConfig::for_provider(), Arc::new(RealClock));
//! let outcome = breaker.call(|| async { Ok::<_, herald_delivery::DeliveryError>("msg-1") }).await;
//! if !outcome.is_success() {
//!     println!("breaker is {}", outcome.circuit_state);
//! }
//! # }
//! ```

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use herald_core::time::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Number of response time samples kept for the running average.
pub const RESPONSE_TIME_WINDOW: usize = 100;

/// Decides whether an error counts toward opening the circuit.
pub type FailurePredicate = Arc<dyn Fn(&DeliveryError) -> bool + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Per-call timeout; a timeout is a counted failure.
    pub timeout: Duration,
    /// How long the circuit stays open before admitting a trial.
    pub reset_timeout: Duration,
    /// Which errors count toward the threshold.
    pub is_failure: FailurePredicate,
}

impl CircuitConfig {
    /// Tuning for external messaging providers: generous timeout, long
    /// reset window.
    pub fn for_provider() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Tuning for the delivery store: short timeout, aggressive threshold.
    pub fn for_store() -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Replaces the failure predicate.
    #[must_use]
    pub fn with_failure_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DeliveryError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    /// Rejects zero thresholds and durations.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(DeliveryError::configuration("failure_threshold must be greater than 0"));
        }
        if self.timeout.is_zero() {
            return Err(DeliveryError::configuration("circuit timeout must be greater than 0"));
        }
        if self.reset_timeout.is_zero() {
            return Err(DeliveryError::configuration("reset_timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(60),
            is_failure: Arc::new(DeliveryError::counts_toward_circuit),
        }
    }
}

impl fmt::Debug for CircuitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("timeout", &self.timeout)
            .field("reset_timeout", &self.reset_timeout)
            .finish_non_exhaustive()
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One trial call decides whether to close again.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters kept for one breaker over the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    /// Counted failures since the last success or state reset.
    pub consecutive_failures: u32,
    /// All counted failures.
    pub total_failures: u64,
    /// All successes.
    pub total_successes: u64,
    /// Times the circuit opened.
    pub total_opens: u64,
    /// Calls rejected without being attempted.
    pub total_rejections: u64,
    /// Last counted failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    response_times: VecDeque<Duration>,
}

impl CircuitMetrics {
    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    /// Mean of the retained response time samples.
    pub fn average_response_time(&self) -> Duration {
        let samples = u32::try_from(self.response_times.len()).unwrap_or(u32::MAX);
        if samples == 0 {
            return Duration::ZERO;
        }
        self.response_times.iter().sum::<Duration>() / samples
    }

    /// Number of retained response time samples.
    pub fn response_time_samples(&self) -> usize {
        self.response_times.len()
    }

    /// Successes over successes plus counted failures; 1.0 with no traffic.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            1.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }
}

/// Extra facts about a single `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CallMetadata {
    /// The breaker refused the call; the operation never ran.
    pub rejected: bool,
    /// The call was the half-open trial.
    pub trial: bool,
    /// The operation exceeded the per-call timeout.
    pub timed_out: bool,
    /// The error counted toward the failure threshold.
    pub counted_failure: bool,
}

/// Result envelope returned by [`CircuitBreaker::call`]. Never a panic,
/// never a bare error: callers branch on `result`.
#[derive(Debug)]
pub struct CallOutcome<T> {
    /// Operation result or the rejection/timeout error.
    pub result: Result<T>,
    /// Breaker state after the call was recorded.
    pub circuit_state: CircuitState,
    /// Time spent in the operation, zero for rejections.
    pub execution_time: Duration,
    /// Call details.
    pub metadata: CallMetadata,
}

impl<T> CallOutcome<T> {
    /// Returns true when the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Discards the envelope.
    ///
    /// # Errors
    ///
    /// Returns the operation error or the breaker rejection.
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Dashboard view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerHealth {
    /// Protected resource.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Counted failures since the last success.
    pub consecutive_failures: u32,
    /// All successes.
    pub total_successes: u64,
    /// All counted failures.
    pub total_failures: u64,
    /// Times the circuit opened.
    pub total_opens: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
    /// Successes over successes plus counted failures.
    pub success_rate: f64,
    /// Mean of the last [`RESPONSE_TIME_WINDOW`] response times.
    pub average_response_time_ms: u64,
    /// Last counted failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last success.
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    metrics: CircuitMetrics,
    trial_in_flight: bool,
}

enum Admission {
    Admitted { trial: bool },
    Rejected { retry_after: Duration },
}

/// Circuit breaker for a single channel or resource.
///
/// Shared by every worker on that channel; state is serialized behind a
/// mutex that is never held across the protected call.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                metrics: CircuitMetrics::default(),
                trial_in_flight: false,
            }),
        }
    }

    /// Name of the protected resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Runs `operation` under the breaker.
    ///
    /// While open the operation is not invoked and the result carries
    /// `DeliveryError::CircuitOpen` with the remaining reset time.
    pub async fn call<T, F, Fut>(&self, operation: F) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = match self.admit().await {
            Admission::Admitted { trial } => trial,
            Admission::Rejected { retry_after } => {
                let circuit_state = self.state().await;
                debug!(
                    circuit = %self.name,
                    state = %circuit_state,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "call rejected by open circuit"
                );
                return CallOutcome {
                    result: Err(DeliveryError::circuit_open(self.name.clone(), retry_after)),
                    circuit_state,
                    execution_time: Duration::ZERO,
                    metadata: CallMetadata { rejected: true, ..CallMetadata::default() },
                };
            },
        };

        let started = tokio::time::Instant::now();
        let (result, timed_out) = match tokio::time::timeout(self.config.timeout, operation()).await
        {
            Ok(result) => (result, false),
            Err(_) => (Err(DeliveryError::timeout(self.config.timeout)), true),
        };
        let execution_time = started.elapsed();

        let counted_failure = result.as_ref().err().is_some_and(|err| (self.config.is_failure)(err));
        let circuit_state =
            self.record(result.is_ok(), counted_failure, execution_time, trial).await;

        CallOutcome {
            result,
            circuit_state,
            execution_time,
            metadata: CallMetadata { rejected: false, trial, timed_out, counted_failure },
        }
    }

    /// Current state. An open circuit whose reset window has passed still
    /// reports `Open` until the next call moves it to half-open.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Snapshot of the breaker metrics.
    pub async fn metrics(&self) -> CircuitMetrics {
        self.inner.lock().await.metrics.clone()
    }

    /// Dashboard view of the breaker.
    pub async fn health(&self) -> BreakerHealth {
        let inner = self.inner.lock().await;
        let metrics = &inner.metrics;
        BreakerHealth {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: metrics.consecutive_failures,
            total_successes: metrics.total_successes,
            total_failures: metrics.total_failures,
            total_opens: metrics.total_opens,
            total_rejections: metrics.total_rejections,
            success_rate: metrics.success_rate(),
            average_response_time_ms: u64::try_from(metrics.average_response_time().as_millis())
                .unwrap_or(u64::MAX),
            last_failure_at: metrics.last_failure_at,
            last_success_at: metrics.last_success_at,
        }
    }

    /// Closes the circuit and clears the failure streak. Lifetime totals
    /// are kept.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        info!(circuit = %self.name, previous = %inner.state, "circuit breaker reset");
        inner.state = CircuitState::Closed;
        inner.trial_in_flight = false;
        inner.metrics.consecutive_failures = 0;
        inner.metrics.opened_at = None;
    }

    /// Forces a state, for operators and tests.
    pub async fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock().await;
        match state {
            CircuitState::Closed => {
                inner.metrics.consecutive_failures = 0;
                inner.metrics.opened_at = None;
            },
            CircuitState::Open => inner.metrics.opened_at = Some(self.clock.now()),
            CircuitState::HalfOpen => {},
        }
        inner.state = state;
        inner.trial_in_flight = false;
        warn!(circuit = %self.name, state = %state, "circuit state forced");
    }

    async fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().await;
        let state = inner.state;

        match state {
            CircuitState::Closed => Admission::Admitted { trial: false },
            CircuitState::Open => {
                let elapsed = inner
                    .metrics
                    .opened_at
                    .map_or(self.config.reset_timeout, |opened| self.clock.now().duration_since(opened));

                if elapsed >= self.config.reset_timeout {
                    self.transition_to_half_open(&mut inner);
                    inner.trial_in_flight = true;
                    Admission::Admitted { trial: true }
                } else {
                    inner.metrics.total_rejections += 1;
                    Admission::Rejected { retry_after: self.config.reset_timeout - elapsed }
                }
            },
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.total_rejections += 1;
                    Admission::Rejected { retry_after: self.config.timeout }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Admitted { trial: true }
                }
            },
        }
    }

    async fn record(
        &self,
        succeeded: bool,
        counted_failure: bool,
        elapsed: Duration,
        trial: bool,
    ) -> CircuitState {
        let mut inner = self.inner.lock().await;
        inner.metrics.record_response_time(elapsed);
        if trial {
            inner.trial_in_flight = false;
        }

        if succeeded {
            inner.metrics.total_successes += 1;
            inner.metrics.last_success_at = Some(self.clock.now_utc());
            let state = inner.state;
            match state {
                CircuitState::Closed => inner.metrics.consecutive_failures = 0,
                CircuitState::HalfOpen if trial => self.transition_to_closed(&mut inner),
                CircuitState::HalfOpen | CircuitState::Open => {
                    warn!(circuit = %self.name, state = %state, "late success recorded");
                },
            }
        } else if counted_failure {
            inner.metrics.total_failures += 1;
            inner.metrics.consecutive_failures += 1;
            inner.metrics.last_failure_at = Some(self.clock.now_utc());
            let state = inner.state;
            match state {
                CircuitState::Closed
                    if inner.metrics.consecutive_failures >= self.config.failure_threshold =>
                {
                    self.transition_to_open(&mut inner);
                },
                CircuitState::HalfOpen if trial => self.transition_to_open(&mut inner),
                _ => {},
            }
        }

        inner.state
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        warn!(
            circuit = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "circuit breaker opened"
        );
        inner.state = CircuitState::Open;
        inner.metrics.opened_at = Some(self.clock.now());
        inner.metrics.total_opens += 1;
    }

    fn transition_to_half_open(&self, inner: &mut BreakerState) {
        info!(circuit = %self.name, "circuit breaker half-open, admitting trial call");
        inner.state = CircuitState::HalfOpen;
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        info!(circuit = %self.name, "circuit breaker closed, resource recovered");
        inner.state = CircuitState::Closed;
        inner.metrics.consecutive_failures = 0;
        inner.metrics.opened_at = None;
    }
}
