//! Integration tests for the delivery job lifecycle.
//!
//! Drives `DeliveryPipeline` through the retry manager and channel breaker
//! against a scripted provider and an in-memory store with injected
//! failures.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration, time::SystemTime};

use herald_core::{
    events::RecordingEventHandler,
    models::{
        Channel, DeliveryJob, MessageContent, NotificationStatus, NotificationUpdate, Recipient,
    },
    time::{Clock, TestClock},
};
use herald_delivery::{
    adapter::mock::ScriptedAdapter,
    metrics::DeliveryMetrics,
    reconcile::StoreStep,
    retry::StopReason,
    store::{mock::MockDeliveryStore, DeliveryStore},
    worker::{ChannelResilience, DeliveryPipeline},
    ChannelAdapter, CircuitConfig, CircuitState, DeliveryError, DeliveryOutcome, ErrorKind,
    RetryConfig,
};

struct Harness {
    clock: TestClock,
    adapter: Arc<ScriptedAdapter>,
    store: Arc<MockDeliveryStore>,
    events: Arc<RecordingEventHandler>,
    metrics: Arc<DeliveryMetrics>,
    pipeline: Arc<DeliveryPipeline>,
}

fn harness(adapter: ScriptedAdapter, circuit: CircuitConfig, retry: RetryConfig) -> Harness {
    let clock = TestClock::with_start_time(SystemTime::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let adapter = Arc::new(adapter);
    let store = Arc::new(MockDeliveryStore::new().with_clock(shared.clone()));
    let events = Arc::new(RecordingEventHandler::new());
    let metrics = Arc::new(DeliveryMetrics::new());
    let resilience = Arc::new(
        ChannelResilience::new(adapter.channel(), circuit, retry, shared.clone())
            .expect("valid config"),
    );
    let pipeline = Arc::new(DeliveryPipeline::new(
        adapter.clone(),
        resilience,
        store.clone(),
        events.clone(),
        metrics.clone(),
        shared,
    ));
    Harness { clock, adapter, store, events, metrics, pipeline }
}

fn deterministic_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        jitter_enabled: false,
        global_timeout: None,
        ..RetryConfig::default()
    }
}

fn job(h: &Harness, channel: Channel) -> DeliveryJob {
    DeliveryJob::new(
        channel,
        Recipient::new("guest-40", "guest40@example.com"),
        MessageContent::text("Your spa appointment is at 10:00"),
    )
    .scheduled_for(h.clock.now_utc())
}

#[tokio::test]
async fn transient_failures_are_retried_until_sent() {
    let h = harness(
        ScriptedAdapter::new(Channel::Email),
        CircuitConfig::for_provider(),
        deterministic_retry(3),
    );
    h.adapter.push_err(DeliveryError::provider(Some(502), "bad gateway")).await;
    h.adapter.push_err(DeliveryError::timeout(Duration::from_secs(30))).await;
    h.adapter.push_ok("em-9", None).await;
    let job = job(&h, Channel::Email);

    let report = h.pipeline.process_job(job.clone()).await;

    assert!(report.is_success());
    assert_eq!(report.attempts, 3);
    assert_eq!(report.stop_reason, Some(StopReason::Succeeded));
    assert_eq!(h.clock.total_slept(), Duration::from_secs(3));

    let record = h.store.record(job.notification_id).await.expect("record");
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.attempts, 3);
    assert_eq!(h.metrics.channel(Channel::Email).await.sent, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_record_with_the_last_error() {
    let h = harness(
        ScriptedAdapter::new(Channel::Sms),
        CircuitConfig { failure_threshold: 10, ..CircuitConfig::for_provider() },
        deterministic_retry(3),
    );
    h.adapter.fail_always(DeliveryError::provider(Some(500), "carrier unavailable")).await;
    let job = job(&h, Channel::Sms);

    let report = h.pipeline.process_job(job.clone()).await;

    assert_eq!(report.attempts, 4);
    assert_eq!(report.stop_reason, Some(StopReason::RetriesExhausted));
    assert_eq!(report.error().map(DeliveryError::kind), Some(ErrorKind::Provider));

    let record = h.store.record(job.notification_id).await.expect("record");
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.attempts, 4);
    assert!(record.last_error.as_deref().is_some_and(|e| e.contains("carrier unavailable")));
    assert_eq!(h.events.event_names().await, vec!["notification.failed"]);
}

#[tokio::test]
async fn store_outage_does_not_block_delivery() {
    let h = harness(
        ScriptedAdapter::new(Channel::Email),
        CircuitConfig::for_provider(),
        deterministic_retry(3),
    );
    h.adapter.push_ok("em-10", Some(0.002)).await;
    let job = job(&h, Channel::Email);
    h.store.insert(job.to_record(h.clock.now_utc())).await;
    h.store.fail_updates("deadlock detected").await;

    let report = h.pipeline.process_job(job.clone()).await;

    assert!(report.is_success());
    assert!(!report.record_finalized);
    let steps: Vec<StoreStep> = report.store_issues.iter().map(|issue| issue.step).collect();
    assert_eq!(steps, vec![StoreStep::MarkSending, StoreStep::Finalize]);
    assert_eq!(h.adapter.calls(), 1);
    assert_eq!(h.events.event_names().await, vec!["notification.sent"]);

    let stats = h.metrics.channel(Channel::Email).await;
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.store_issues, 2);
}

#[tokio::test]
async fn late_success_does_not_reopen_a_failed_record() {
    let h = harness(
        ScriptedAdapter::new(Channel::Chat).with_latency(Duration::from_millis(100)),
        CircuitConfig::for_provider(),
        deterministic_retry(0),
    );
    let job = job(&h, Channel::Chat);
    let id = job.notification_id;

    let pipeline = h.pipeline.clone();
    let in_flight = tokio::spawn(async move { pipeline.process_job(job).await });

    for _ in 0..100 {
        if h.adapter.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let closed = h
        .store
        .update(id, NotificationUpdate::failed("closed out by operator", 1))
        .await
        .expect("store up");
    assert!(closed);

    let report = in_flight.await.expect("job task");

    assert!(report.is_success());
    assert!(!report.record_finalized);
    let record = h.store.record(id).await.expect("record");
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("closed out by operator"));
    assert!(record.external_message_id.is_none());
}

#[tokio::test]
async fn open_breaker_is_rechecked_on_every_retry() {
    let circuit = CircuitConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(600),
        ..CircuitConfig::for_provider()
    };
    let h = harness(ScriptedAdapter::new(Channel::Sms), circuit, deterministic_retry(2));
    for _ in 0..3 {
        h.adapter.push_err(DeliveryError::connection("connection reset")).await;
    }

    let first = h.pipeline.process_job(job(&h, Channel::Sms)).await;
    assert_eq!(first.attempts, 3);
    assert_eq!(first.error().map(DeliveryError::kind), Some(ErrorKind::Connection));
    assert_eq!(h.pipeline.resilience().breaker.state().await, CircuitState::Open);

    // rejected first, then the retry waits out the reset window and the trial succeeds
    let second = h.pipeline.process_job(job(&h, Channel::Sms)).await;
    assert!(second.is_success());
    assert_eq!(second.attempts, 2);
    assert!(matches!(
        second.attempt_details[0].error,
        Some(DeliveryError::CircuitOpen { retry_after_ms: 600_000, .. })
    ));
    assert_eq!(second.attempt_details[0].delay, Some(Duration::from_secs(600)));
    assert_eq!(h.adapter.calls(), 4);
    assert_eq!(h.pipeline.resilience().breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn breaker_rejections_fail_jobs_without_calling_the_provider() {
    let circuit = CircuitConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(3600),
        ..CircuitConfig::for_provider()
    };
    let h = harness(ScriptedAdapter::new(Channel::Email), circuit, deterministic_retry(0));
    h.adapter.fail_always(DeliveryError::provider(Some(503), "unavailable")).await;

    h.pipeline.process_job(job(&h, Channel::Email)).await;
    h.pipeline.process_job(job(&h, Channel::Email)).await;
    let rejected = job(&h, Channel::Email);
    let report = h.pipeline.process_job(rejected.clone()).await;

    assert_eq!(h.adapter.calls(), 2);
    assert_eq!(report.error().map(DeliveryError::kind), Some(ErrorKind::CircuitOpen));
    let record = h.store.record(rejected.notification_id).await.expect("record");
    assert_eq!(record.status, NotificationStatus::Failed);
    assert!(record.last_error.as_deref().is_some_and(|e| e.contains("circuit open for email")));

    let health = h.pipeline.resilience().breaker.health().await;
    assert_eq!(health.total_opens, 1);
    assert_eq!(health.total_rejections, 1);
    assert!(matches!(report.outcome, DeliveryOutcome::Failed(_)));
}
