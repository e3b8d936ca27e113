//! Scheduled reminder sweep.
//!
//! Each sweep first expires reminders stuck in `processing`, then fires
//! the due ones: claim (`scheduled -> processing`), spawn one delivery job
//! per configured channel, and settle the reminder as `sent`, re-armed or
//! `failed`. A reminder that cannot be claimed was taken by another sweep
//! and is skipped.
//!
//! Firing attempts are counted on the reminder and are independent of the
//! per-send retry policy; the retry manager only supplies the back-off
//! used to re-arm a reminder.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{
    models::{
        Channel, DeliveryJob, JobMetadata, MessageContent, NotificationUpdate, Priority,
        Recipient, ReminderId, ReminderType, ScheduledReminder,
    },
    time::Clock,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::JobQueue,
    retry::{RetryConfig, RetryManager},
    store::{DeliveryStore, ReminderStore},
};

/// Reminder sweep settings.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Reminders fired per sweep at most.
    pub batch_size: usize,
    /// How long a reminder may sit in `processing` before it expires.
    pub expiry_window: Duration,
    /// Channels every reminder is delivered on.
    pub channels: Vec<Channel>,
    /// Back-off for re-arming a reminder whose firing failed. Only the delay
    /// settings are used.
    pub refire_backoff: RetryConfig,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            batch_size: 100,
            expiry_window: Duration::from_secs(2 * 60 * 60),
            channels: vec![Channel::Email],
            refire_backoff: RetryConfig {
                initial_delay: Duration::from_secs(5 * 60),
                max_delay: Duration::from_secs(60 * 60),
                ..RetryConfig::default()
            },
        }
    }
}

impl ReminderConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for an empty batch or channel
    /// list, a zero interval or window, or an invalid back-off.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("reminder batch_size must be positive"));
        }
        if self.channels.is_empty() {
            return Err(DeliveryError::configuration("reminder channels must not be empty"));
        }
        if self.sweep_interval.is_zero() || self.expiry_window.is_zero() {
            return Err(DeliveryError::configuration(
                "reminder sweep_interval and expiry_window must be positive",
            ));
        }
        self.refire_backoff.validate()
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Reminders moved to `expired`.
    pub expired: usize,
    /// Reminders whose jobs were all enqueued.
    pub fired: usize,
    /// Delivery jobs enqueued.
    pub jobs_enqueued: usize,
    /// Failed firings re-armed for a later sweep.
    pub rescheduled: usize,
    /// Failed firings with no attempts left.
    pub failed: usize,
    /// Reminders another writer had already moved on.
    pub skipped: usize,
    /// Store operations that failed.
    pub store_errors: usize,
}

/// Fires due reminders into the delivery queue.
pub struct ReminderProcessor {
    config: ReminderConfig,
    reminders: Arc<dyn ReminderStore>,
    deliveries: Arc<dyn DeliveryStore>,
    queue: Arc<dyn JobQueue>,
    refire: RetryManager,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ReminderProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderProcessor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ReminderProcessor {
    /// Creates a processor.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `config` is invalid.
    pub fn new(
        config: ReminderConfig,
        reminders: Arc<dyn ReminderStore>,
        deliveries: Arc<dyn DeliveryStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let refire = RetryManager::new(config.refire_backoff.clone(), clock.clone());
        Ok(Self { config, reminders, deliveries, queue, refire, clock })
    }

    /// Sweep settings.
    pub fn config(&self) -> &ReminderConfig {
        &self.config
    }

    /// Creates the reminders of `reminder_types` for a booked event.
    ///
    /// Types whose firing time already passed are left out, as are
    /// duplicates of a reminder the booking already has.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the store fails.
    pub async fn schedule(
        &self,
        booking_ref: &str,
        recipient: &Recipient,
        event_at: DateTime<Utc>,
        reminder_types: &[ReminderType],
    ) -> Result<Vec<ReminderId>> {
        let now = self.clock.now_utc();
        let mut created = Vec::new();

        for &reminder_type in reminder_types {
            let mut reminder =
                ScheduledReminder::new(booking_ref, recipient, reminder_type, event_at);
            if reminder.scheduled_date <= now {
                debug!(
                    booking_ref,
                    reminder_type = %reminder_type,
                    "reminder time already passed"
                );
                continue;
            }
            reminder.created_at = now;
            reminder.updated_at = now;

            let id = reminder.id;
            if self.reminders.create(reminder).await? {
                created.push(id);
            } else {
                debug!(booking_ref, reminder_type = %reminder_type, "reminder already exists");
            }
        }

        info!(booking_ref, count = created.len(), "reminders scheduled");
        Ok(created)
    }

    /// Cancels a reminder that has not fired. Returns whether it applied.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the store fails.
    pub async fn cancel(&self, id: ReminderId) -> Result<bool> {
        let cancelled = self.reminders.cancel(id, self.clock.now_utc()).await?;
        if cancelled {
            info!(reminder_id = %id, "reminder cancelled");
        } else {
            warn!(reminder_id = %id, "reminder not cancelled, not in scheduled status");
        }
        Ok(cancelled)
    }

    /// Runs one expire-then-fire pass. Store failures are counted, not
    /// raised.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.expire_stale(&mut report).await;
        self.fire_due(&mut report).await;

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                fired = report.fired,
                jobs_enqueued = report.jobs_enqueued,
                rescheduled = report.rescheduled,
                failed = report.failed,
                skipped = report.skipped,
                store_errors = report.store_errors,
                "reminder sweep finished"
            );
        }
        report
    }

    /// Sweeps every `sweep_interval` until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            channels = ?self.config.channels,
            "reminder sweeper starting"
        );

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }
            self.sweep().await;

            tokio::select! {
                () = self.clock.sleep(self.config.sweep_interval) => {},
                () = cancellation_token.cancelled() => break,
            }
        }

        info!("reminder sweeper stopped");
    }

    async fn expire_stale(&self, report: &mut SweepReport) {
        let now = self.clock.now_utc();
        let window = chrono::Duration::from_std(self.config.expiry_window)
            .unwrap_or_else(|_| chrono::Duration::hours(2));

        let stale = match self.reminders.find_expired(now - window).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "failed to look up expired reminders");
                report.store_errors += 1;
                return;
            },
        };

        for reminder in stale {
            match self.reminders.mark_as_expired(reminder.id, now).await {
                Ok(true) => {
                    warn!(
                        reminder_id = %reminder.id,
                        booking_ref = %reminder.booking_ref,
                        "reminder expired while processing"
                    );
                    report.expired += 1;
                },
                Ok(false) => {
                    debug!(reminder_id = %reminder.id, "reminder left processing before expiry");
                },
                Err(e) => {
                    warn!(reminder_id = %reminder.id, error = %e, "failed to expire reminder");
                    report.store_errors += 1;
                },
            }
        }
    }

    async fn fire_due(&self, report: &mut SweepReport) {
        let now = self.clock.now_utc();
        let ready = match self.reminders.find_scheduled_ready(now, self.config.batch_size).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "failed to look up due reminders");
                report.store_errors += 1;
                return;
            },
        };

        for reminder in ready {
            match self.reminders.mark_as_processing(reminder.id, now).await {
                Ok(true) => {},
                Ok(false) => {
                    warn!(
                        reminder_id = %reminder.id,
                        status = %reminder.status,
                        "reminder not in scheduled status, skipping"
                    );
                    report.skipped += 1;
                    continue;
                },
                Err(e) => {
                    warn!(reminder_id = %reminder.id, error = %e, "failed to claim reminder");
                    report.store_errors += 1;
                    continue;
                },
            }

            // mark_as_processing counted this attempt
            let attempts = reminder.attempts.saturating_add(1);

            match self.enqueue_jobs(&reminder, now).await {
                Ok(jobs) => {
                    report.jobs_enqueued += jobs;
                    self.settle_sent(&reminder, now, report).await;
                },
                Err(error) => self.settle_failed(&reminder, attempts, &error, now, report).await,
            }
        }
    }

    async fn enqueue_jobs(&self, reminder: &ScheduledReminder, now: DateTime<Utc>) -> Result<usize> {
        let mut enqueued = 0;
        for &channel in &self.config.channels {
            let job = reminder_job(reminder, channel, now);

            // Best-effort: the worker creates the record if this fails.
            if let Err(e) = self.deliveries.create(job.to_record(now)).await {
                warn!(
                    reminder_id = %reminder.id,
                    notification_id = %job.notification_id,
                    error = %e,
                    "failed to create reminder notification record"
                );
            }

            let id = job.notification_id;
            if let Err(error) = self.queue.enqueue(job).await {
                let update = NotificationUpdate::failed(format!("enqueue failed: {error}"), 0);
                if let Err(e) = self.deliveries.update(id, update).await {
                    warn!(notification_id = %id, error = %e, "failed to mark unqueued record failed");
                }
                return Err(error);
            }
            enqueued += 1;
        }
        Ok(enqueued)
    }

    async fn settle_sent(
        &self,
        reminder: &ScheduledReminder,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        match self.reminders.mark_as_sent(reminder.id, now).await {
            Ok(true) => {
                debug!(reminder_id = %reminder.id, "reminder fired");
                report.fired += 1;
            },
            Ok(false) => {
                warn!(reminder_id = %reminder.id, "reminder no longer processing, not marked sent");
                report.skipped += 1;
            },
            Err(e) => {
                warn!(reminder_id = %reminder.id, error = %e, "failed to mark reminder sent");
                report.store_errors += 1;
            },
        }
    }

    async fn settle_failed(
        &self,
        reminder: &ScheduledReminder,
        attempts: i32,
        error: &DeliveryError,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let next_retry_at = if attempts < reminder.max_attempts {
            self.next_retry_at(attempts, error, now)
        } else {
            None
        };

        match self.reminders.mark_as_failed(reminder.id, error.to_string(), next_retry_at, now).await
        {
            Ok(true) => {
                if let Some(retry_at) = next_retry_at {
                    warn!(
                        reminder_id = %reminder.id,
                        attempts,
                        retry_at = %retry_at,
                        error = %error,
                        "reminder firing failed, re-armed"
                    );
                    report.rescheduled += 1;
                } else {
                    warn!(
                        reminder_id = %reminder.id,
                        attempts,
                        error = %error,
                        "reminder firing failed, no attempts left"
                    );
                    report.failed += 1;
                }
            },
            Ok(false) => {
                warn!(reminder_id = %reminder.id, "reminder no longer processing, failure not recorded");
                report.skipped += 1;
            },
            Err(e) => {
                warn!(reminder_id = %reminder.id, error = %e, "failed to record reminder failure");
                report.store_errors += 1;
            },
        }
    }

    /// When a reminder that has used `attempts` firings may fire again.
    fn next_retry_at(
        &self,
        attempts: i32,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let retry_index = u32::try_from(attempts.saturating_sub(1)).unwrap_or(0);
        let delay = self.refire.delay_for(retry_index, error);
        chrono::Duration::from_std(delay).ok().map(|delay| now + delay)
    }
}

/// Delivery job announcing `reminder` on `channel`.
pub fn reminder_job(reminder: &ScheduledReminder, channel: Channel, now: DateTime<Utc>) -> DeliveryJob {
    let content = MessageContent::Template {
        template_ref: reminder.reminder_type.template_ref(),
        variables: serde_json::json!({
            "booking_ref": reminder.booking_ref,
            "reminder_type": reminder.reminder_type,
            "event_at": reminder.scheduled_date + reminder.reminder_type.lead_time(),
        }),
    };
    let metadata = JobMetadata {
        trigger: Some(format!("reminder.{}", reminder.reminder_type)),
        reminder_id: Some(reminder.id),
        ..JobMetadata::default()
    };

    DeliveryJob::new(channel, reminder.recipient(), content)
        .with_priority(Priority::High)
        .scheduled_for(now)
        .with_metadata(metadata)
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use herald_core::{
        models::{NotificationStatus, ReminderStatus},
        time::TestClock,
    };

    use super::*;
    use crate::{
        queue::InMemoryJobQueue,
        store::{
            mock::{MockDeliveryStore, MockReminderStore},
            StoreFuture,
        },
    };

    struct Fixture {
        clock: TestClock,
        reminders: Arc<MockReminderStore>,
        deliveries: Arc<MockDeliveryStore>,
        queue: Arc<InMemoryJobQueue>,
        processor: ReminderProcessor,
    }

    fn fixture(channels: Vec<Channel>) -> Fixture {
        let clock = TestClock::with_start_time(SystemTime::now());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let reminders = Arc::new(MockReminderStore::new());
        let deliveries = Arc::new(MockDeliveryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(shared.clone()));
        let config = ReminderConfig {
            channels,
            refire_backoff: RetryConfig {
                jitter_enabled: false,
                ..ReminderConfig::default().refire_backoff
            },
            ..ReminderConfig::default()
        };
        let processor = ReminderProcessor::new(
            config,
            reminders.clone(),
            deliveries.clone(),
            queue.clone(),
            shared,
        )
        .expect("valid config");
        Fixture { clock, reminders, deliveries, queue, processor }
    }

    fn due_reminder(clock: &TestClock) -> ScheduledReminder {
        let recipient = Recipient::new("guest-12", "guest12@example.com");
        let event_at = clock.now_utc() + chrono::Duration::hours(23);
        ScheduledReminder::new("BK-1042", &recipient, ReminderType::TwentyFourHour, event_at)
    }

    #[tokio::test]
    async fn due_reminder_spawns_one_job_per_channel() {
        let fx = fixture(vec![Channel::Email, Channel::Sms]);
        let reminder = due_reminder(&fx.clock);
        fx.reminders.insert(reminder.clone()).await;

        let report = fx.processor.sweep().await;

        assert_eq!(report.fired, 1);
        assert_eq!(report.jobs_enqueued, 2);
        let stored = fx.reminders.reminder(reminder.id).await.expect("reminder");
        assert_eq!(stored.status, ReminderStatus::Sent);
        assert_eq!(stored.attempts, 1);
        assert_eq!(fx.deliveries.len().await, 2);

        let job = fx.queue.dequeue(Channel::Sms).await.expect("sms job");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.metadata.reminder_id, Some(reminder.id));
        assert!(matches!(
            job.content,
            MessageContent::Template { ref template_ref, .. } if template_ref == "reminder.24_hour"
        ));
    }

    #[tokio::test]
    async fn second_sweep_does_not_fire_again() {
        let fx = fixture(vec![Channel::Email]);
        fx.reminders.insert(due_reminder(&fx.clock)).await;

        fx.processor.sweep().await;
        let again = fx.processor.sweep().await;

        assert_eq!(again, SweepReport::default());
        assert_eq!(fx.queue.depth(Channel::Email).await, 1);
    }

    #[tokio::test]
    async fn failed_firing_is_rearmed_with_backoff() {
        let fx = fixture(vec![Channel::Email]);
        let reminder = due_reminder(&fx.clock);
        fx.reminders.insert(reminder.clone()).await;
        fx.queue.close().await;

        let report = fx.processor.sweep().await;

        assert_eq!(report.rescheduled, 1);
        let stored = fx.reminders.reminder(reminder.id).await.expect("reminder");
        assert_eq!(stored.status, ReminderStatus::Scheduled);
        assert_eq!(stored.next_retry_at, Some(fx.clock.now_utc() + chrono::Duration::minutes(5)));
        assert!(!stored.is_ready(fx.clock.now_utc()));

        // the record whose job never made it into the queue is closed out
        assert_eq!(fx.deliveries.count_with_status(NotificationStatus::Failed).await, 1);
    }

    #[tokio::test]
    async fn last_attempt_failure_is_terminal() {
        let fx = fixture(vec![Channel::Email]);
        let mut reminder = due_reminder(&fx.clock);
        reminder.attempts = reminder.max_attempts - 1;
        fx.reminders.insert(reminder.clone()).await;
        fx.queue.close().await;

        let report = fx.processor.sweep().await;

        assert_eq!(report.failed, 1);
        let stored = fx.reminders.reminder(reminder.id).await.expect("reminder");
        assert_eq!(stored.status, ReminderStatus::Failed);
        assert_eq!(stored.next_retry_at, None);
    }

    #[tokio::test]
    async fn stale_processing_reminder_expires() {
        let fx = fixture(vec![Channel::Email]);
        let mut reminder = due_reminder(&fx.clock);
        reminder.status = ReminderStatus::Processing;
        reminder.processing_started_at = Some(fx.clock.now_utc() - chrono::Duration::hours(3));
        fx.reminders.insert(reminder.clone()).await;

        let report = fx.processor.sweep().await;

        assert_eq!(report.expired, 1);
        let stored = fx.reminders.reminder(reminder.id).await.expect("reminder");
        assert_eq!(stored.status, ReminderStatus::Expired);
    }

    #[tokio::test]
    async fn schedule_skips_passed_and_duplicate_types() {
        let fx = fixture(vec![Channel::Email]);
        let recipient = Recipient::new("guest-4", "guest4@example.com");
        let event_at = fx.clock.now_utc() + chrono::Duration::hours(30);
        let types = [ReminderType::SevenDay, ReminderType::TwentyFourHour, ReminderType::OneHour];

        let created = fx.processor.schedule("BK-7", &recipient, event_at, &types).await.expect("ok");
        assert_eq!(created.len(), 2);

        let again = fx.processor.schedule("BK-7", &recipient, event_at, &types).await.expect("ok");
        assert!(again.is_empty());

        assert!(fx.processor.cancel(created[0]).await.expect("cancel"));
        assert!(!fx.processor.cancel(created[0]).await.expect("cancel"));
    }

    /// Holds every `find_scheduled_ready` until both sweepers have looked,
    /// so both see the same due reminder before either claims it.
    struct LockstepReminderStore {
        inner: Arc<MockReminderStore>,
        barrier: tokio::sync::Barrier,
    }

    impl ReminderStore for LockstepReminderStore {
        fn create(&self, reminder: ScheduledReminder) -> StoreFuture<'_, bool> {
            self.inner.create(reminder)
        }

        fn find_by_id(&self, id: ReminderId) -> StoreFuture<'_, Option<ScheduledReminder>> {
            self.inner.find_by_id(id)
        }

        fn find_scheduled_ready(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<ScheduledReminder>> {
            Box::pin(async move {
                let ready = self.inner.find_scheduled_ready(now, limit).await;
                self.barrier.wait().await;
                ready
            })
        }

        fn find_expired(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<ScheduledReminder>> {
            self.inner.find_expired(cutoff)
        }

        fn mark_as_processing(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            self.inner.mark_as_processing(id, now)
        }

        fn mark_as_sent(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            self.inner.mark_as_sent(id, now)
        }

        fn mark_as_failed(
            &self,
            id: ReminderId,
            error: String,
            next_retry_at: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            self.inner.mark_as_failed(id, error, next_retry_at, now)
        }

        fn mark_as_expired(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            self.inner.mark_as_expired(id, now)
        }

        fn cancel(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            self.inner.cancel(id, now)
        }
    }

    #[tokio::test]
    async fn racing_sweeps_fire_a_reminder_once() {
        let fx = fixture(vec![Channel::Email]);
        let reminder = due_reminder(&fx.clock);
        fx.reminders.insert(reminder.clone()).await;

        let shared: Arc<dyn Clock> = Arc::new(fx.clock.clone());
        let lockstep: Arc<dyn ReminderStore> = Arc::new(LockstepReminderStore {
            inner: fx.reminders.clone(),
            barrier: tokio::sync::Barrier::new(2),
        });
        let sweeper = |store: Arc<dyn ReminderStore>| {
            ReminderProcessor::new(
                fx.processor.config().clone(),
                store,
                fx.deliveries.clone(),
                fx.queue.clone(),
                shared.clone(),
            )
            .expect("valid config")
        };
        let first = sweeper(lockstep.clone());
        let second = sweeper(lockstep);

        let (a, b) = tokio::join!(first.sweep(), second.sweep());

        assert_eq!(a.fired + b.fired, 1);
        assert_eq!(a.skipped + b.skipped, 1);
        assert_eq!(a.jobs_enqueued + b.jobs_enqueued, 1);
        assert_eq!(fx.queue.depth(Channel::Email).await, 1);
        assert_eq!(fx.deliveries.len().await, 1);

        let stored = fx.reminders.reminder(reminder.id).await.expect("reminder");
        assert_eq!(stored.status, ReminderStatus::Sent);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn store_outage_is_counted() {
        let fx = fixture(vec![Channel::Email]);
        fx.reminders.fail_everything("connection reset").await;

        let report = fx.processor.sweep().await;

        assert_eq!(report.store_errors, 2);
        assert_eq!(report.fired, 0);
    }
}
