//! Integration tests for restart recovery.
//!
//! A record left in `sending` by a crashed worker is closed out as failed
//! and never re-sent, even when its job shows up again. Records a previous
//! run still owed a delivery are put back on the queue of the next one.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration, time::SystemTime};

use herald_core::{
    models::{
        Channel, DeliveryJob, MessageContent, NotificationStatus, Recipient, ReminderType,
        ScheduledReminder,
    },
    time::{Clock, TestClock},
};
use herald_delivery::{
    adapter::mock::ScriptedAdapter,
    context::OUTCOME_UNKNOWN_ERROR,
    queue::JobQueue,
    store::mock::{MockDeliveryStore, MockReminderStore},
    AppContext, ContextConfig, DeliveryOutcome, ReminderConfig,
};

fn job(clock: &TestClock) -> DeliveryJob {
    DeliveryJob::new(
        Channel::Sms,
        Recipient::new("guest-61", "+15550161"),
        MessageContent::text("Your shuttle leaves in 15 minutes"),
    )
    .scheduled_for(clock.now_utc())
}

#[tokio::test]
async fn stuck_sending_record_is_failed_and_not_resent() {
    let clock = TestClock::with_start_time(SystemTime::now());
    let adapter = Arc::new(ScriptedAdapter::new(Channel::Sms));
    let store = Arc::new(MockDeliveryStore::new());
    let context = AppContext::new(
        ContextConfig {
            reminders: ReminderConfig { channels: vec![Channel::Sms], ..ReminderConfig::default() },
            ..ContextConfig::default()
        },
        store.clone(),
        Arc::new(MockReminderStore::new()),
        Arc::new(clock.clone()),
    )
    .with_adapter(adapter.clone());
    context.initialize().await.expect("initialize");

    let stuck = job(&clock);
    let mut record = stuck.to_record(clock.now_utc() - chrono::Duration::hours(1));
    record.status = NotificationStatus::Sending;
    record.attempts = 2;
    store.insert(record).await;

    let fresh = job(&clock);
    let mut in_progress = fresh.to_record(clock.now_utc());
    in_progress.status = NotificationStatus::Sending;
    store.insert(in_progress).await;

    let recovered =
        context.recover_stale_sending(Duration::from_secs(15 * 60)).await.expect("recover");
    assert_eq!(recovered, 1);

    let closed = store.record(stuck.notification_id).await.expect("record");
    assert_eq!(closed.status, NotificationStatus::Failed);
    assert_eq!(closed.attempts, 2);
    assert_eq!(closed.last_error.as_deref(), Some(OUTCOME_UNKNOWN_ERROR));
    assert_eq!(store.status(fresh.notification_id).await, Some(NotificationStatus::Sending));

    let report = context.send_now(stuck).await.expect("send");
    assert_eq!(report.outcome, DeliveryOutcome::Skipped { status: NotificationStatus::Failed });
    assert_eq!(adapter.calls(), 0);

    let again =
        context.recover_stale_sending(Duration::from_secs(15 * 60)).await.expect("recover");
    assert_eq!(again, 0);
}

#[tokio::test]
async fn owed_reminder_jobs_survive_a_restart() {
    let clock = TestClock::with_start_time(SystemTime::now());
    let deliveries = Arc::new(MockDeliveryStore::new().with_clock(Arc::new(clock.clone())));
    let reminders = Arc::new(MockReminderStore::new());
    let recipient = Recipient::new("guest-62", "guest62@example.com");
    let event_at = clock.now_utc() + chrono::Duration::hours(23);
    let reminder =
        ScheduledReminder::new("BK-5150", &recipient, ReminderType::TwentyFourHour, event_at);
    reminders.insert(reminder.clone()).await;

    let before = AppContext::new(
        ContextConfig::default(),
        deliveries.clone(),
        reminders.clone(),
        Arc::new(clock.clone()),
    )
    .with_adapter(Arc::new(ScriptedAdapter::new(Channel::Email)));
    assert_eq!(before.sweep_reminders().await.expect("sweep").fired, 1);
    drop(before);

    let adapter = Arc::new(ScriptedAdapter::new(Channel::Email));
    let after = AppContext::new(
        ContextConfig::default(),
        deliveries.clone(),
        reminders.clone(),
        Arc::new(clock.clone()),
    )
    .with_adapter(adapter.clone());
    after.initialize().await.expect("initialize");

    assert_eq!(after.requeued_on_start(), Some(1));
    assert_eq!(after.recover_stale_sending(Duration::ZERO).await.expect("recover"), 0);
    assert_eq!(after.sweep_reminders().await.expect("sweep").fired, 0);

    let job = after.queue().dequeue(Channel::Email).await.expect("owed job was re-enqueued");
    assert_eq!(job.metadata.reminder_id, Some(reminder.id));

    let report = after.send_now(job.clone()).await.expect("send");
    assert!(report.is_success());
    assert_eq!(adapter.calls(), 1);
    assert_eq!(deliveries.status(job.notification_id).await, Some(NotificationStatus::Sent));
}
