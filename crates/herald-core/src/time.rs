//! Clock abstraction for deterministic timing.
//!
//! Circuit breaker reset windows, reminder sweeps and retry delays all read
//! time through [`Clock`], so tests can drive them without real waiting.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time for delivery components.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// `RealClock` maps this to `tokio::time::sleep`; `TestClock` advances
    /// virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the system and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Manually driven clock.
///
/// Clones share the same time, so a test can hold one handle while the
/// component under test holds another.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    epoch_ns: u64,
    base_instant: Instant,
    slept_ns: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            epoch_ns: saturating_nanos(since_epoch),
            base_instant: Instant::now(),
            slept_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
    }

    /// Time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Total time requested through [`Clock::sleep`].
    pub fn total_slept(&self) -> Duration {
        Duration::from_nanos(self.slept_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.epoch_ns.saturating_add(
            self.elapsed_ns.load(Ordering::Acquire),
        ))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.slept_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::with_start_time(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(60));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(60));
        assert_eq!(clock.now_system(), start + Duration::from_secs(60));
        assert_eq!(clock.now_utc().timestamp(), 1_060);
    }

    #[tokio::test]
    async fn sleep_advances_and_is_tracked() {
        let clock = TestClock::new();
        let handle = clock.clone();

        clock.sleep(Duration::from_millis(1_500)).await;
        clock.sleep(Duration::from_millis(500)).await;

        assert_eq!(handle.elapsed(), Duration::from_secs(2));
        assert_eq!(handle.total_slept(), Duration::from_secs(2));
    }
}
