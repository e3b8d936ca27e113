//! Integration tests for reminder firing.
//!
//! Runs due reminders through the application context, from sweep to
//! provider, and checks that a reminder never fires twice.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration, time::SystemTime};

use herald_core::{
    models::{
        Channel, MessageContent, NotificationStatus, Recipient, ReminderStatus, ReminderType,
        ScheduledReminder,
    },
    time::{Clock, RealClock, TestClock},
};
use herald_delivery::{
    adapter::mock::ScriptedAdapter,
    queue::JobQueue,
    store::mock::{MockDeliveryStore, MockReminderStore},
    AppContext, ContextConfig, EngineConfig, ReminderConfig, RetryConfig, SweepReport,
};

struct Setup {
    email: Arc<ScriptedAdapter>,
    sms: Arc<ScriptedAdapter>,
    deliveries: Arc<MockDeliveryStore>,
    reminders: Arc<MockReminderStore>,
    context: AppContext,
}

fn setup(clock: Arc<dyn Clock>) -> Setup {
    let email = Arc::new(ScriptedAdapter::new(Channel::Email));
    let sms = Arc::new(ScriptedAdapter::new(Channel::Sms));
    let deliveries = Arc::new(MockDeliveryStore::new());
    let reminders = Arc::new(MockReminderStore::new());
    let config = ContextConfig {
        engine: EngineConfig {
            workers_per_channel: 1,
            poll_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
        },
        retry: RetryConfig { jitter_enabled: false, ..RetryConfig::for_provider() },
        reminders: ReminderConfig {
            channels: vec![Channel::Email, Channel::Sms],
            ..ReminderConfig::default()
        },
        ..ContextConfig::default()
    };
    let context = AppContext::new(config, deliveries.clone(), reminders.clone(), clock)
        .with_adapter(email.clone())
        .with_adapter(sms.clone());
    Setup { email, sms, deliveries, reminders, context }
}

fn due_reminder(now: chrono::DateTime<chrono::Utc>) -> ScheduledReminder {
    let recipient = Recipient::new("guest-88", "guest88@example.com");
    ScheduledReminder::new(
        "BK-2207",
        &recipient,
        ReminderType::TwentyFourHour,
        now + chrono::Duration::hours(23),
    )
}

#[tokio::test]
async fn due_reminder_is_delivered_on_every_channel() {
    let s = setup(Arc::new(RealClock::new()));
    let reminder = due_reminder(chrono::Utc::now());
    s.reminders.insert(reminder.clone()).await;

    let mut engine = s.context.engine().await.expect("engine");
    engine.start().expect("start");

    for _ in 0..400 {
        if s.deliveries.count_with_status(NotificationStatus::Sent).await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.shutdown().await.expect("clean shutdown");

    assert_eq!(s.deliveries.count_with_status(NotificationStatus::Sent).await, 2);
    assert_eq!(s.email.calls(), 1);
    assert_eq!(s.sms.calls(), 1);

    let sent = s.sms.sent_messages().await;
    match &sent[0].content {
        MessageContent::Template { template_ref, variables } => {
            assert_eq!(template_ref, "reminder.24_hour");
            assert_eq!(variables["booking_ref"], "BK-2207");
        },
        other => panic!("expected template content, got {other:?}"),
    }
    assert_eq!(sent[0].metadata.reminder_id, Some(reminder.id));

    let stored = s.reminders.reminder(reminder.id).await.expect("reminder");
    assert_eq!(stored.status, ReminderStatus::Sent);
}

#[tokio::test]
async fn fired_reminder_is_never_fired_again() {
    let clock = TestClock::with_start_time(SystemTime::now());
    let s = setup(Arc::new(clock.clone()));
    let reminder = due_reminder(clock.now_utc());
    s.reminders.insert(reminder.clone()).await;

    let first = s.context.sweep_reminders().await.expect("sweep");
    assert_eq!(first.fired, 1);
    assert_eq!(first.jobs_enqueued, 2);

    clock.advance(Duration::from_secs(3600));
    let second = s.context.sweep_reminders().await.expect("sweep");
    assert_eq!(second, SweepReport::default());
    assert_eq!(s.context.queue().depth(Channel::Email).await, 1);
    assert_eq!(s.context.queue().depth(Channel::Sms).await, 1);

    assert!(!s.context.cancel_reminder(reminder.id).await.expect("cancel"));
}

#[tokio::test]
async fn cancelled_reminder_does_not_fire() {
    let clock = TestClock::with_start_time(SystemTime::now());
    let s = setup(Arc::new(clock.clone()));
    let recipient = Recipient::new("guest-89", "guest89@example.com");
    let event_at = clock.now_utc() + chrono::Duration::hours(25);

    let ids = s
        .context
        .schedule_reminders("BK-3001", &recipient, event_at, &[ReminderType::TwentyFourHour])
        .await
        .expect("schedule");
    assert_eq!(ids.len(), 1);
    assert!(s.context.cancel_reminder(ids[0]).await.expect("cancel"));

    clock.advance(Duration::from_secs(2 * 3600));
    let report = s.context.sweep_reminders().await.expect("sweep");

    assert_eq!(report.fired, 0);
    assert!(s.deliveries.is_empty().await);
    let stored = s.reminders.reminder(ids[0]).await.expect("reminder");
    assert_eq!(stored.status, ReminderStatus::Cancelled);
}

#[tokio::test]
async fn reminder_stuck_in_processing_expires() {
    let clock = TestClock::with_start_time(SystemTime::now());
    let s = setup(Arc::new(clock.clone()));
    let mut reminder = due_reminder(clock.now_utc());
    reminder.status = ReminderStatus::Processing;
    reminder.attempts = 1;
    reminder.processing_started_at = Some(clock.now_utc());
    s.reminders.insert(reminder.clone()).await;

    let early = s.context.sweep_reminders().await.expect("sweep");
    assert_eq!(early.expired, 0);

    clock.advance(Duration::from_secs(2 * 3600 + 60));
    let late = s.context.sweep_reminders().await.expect("sweep");

    assert_eq!(late.expired, 1);
    assert_eq!(late.fired, 0);
    let stored = s.reminders.reminder(reminder.id).await.expect("reminder");
    assert_eq!(stored.status, ReminderStatus::Expired);
}
