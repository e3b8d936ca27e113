//! Channel workers and the per-job delivery pipeline.
//!
//! For every dequeued job a worker runs the same straight-line sequence:
//!
//! 1. **Reconcile** - make sure a record exists and move it to `sending`
//! 2. **Deliver** - `retry.execute(|| breaker.call(|| adapter.send(msg)))`
//! 3. **Finalize** - conditionally write `sent` or `failed`
//! 4. **Metrics** - counted regardless of store outcome
//! 5. **Event** - publish `notification.sent` or `notification.failed`
//!
//! Store failures never change what is delivered; they are collected into
//! the [`DeliveryReport`].

use std::{fmt, sync::Arc, time::Duration};

use herald_core::{
    events::{EventHandler, NotificationEvent, NotificationFailedEvent, NotificationSentEvent},
    models::{Channel, DeliveryJob, NotificationId, NotificationStatus, NotificationUpdate},
    time::Clock,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    adapter::{ChannelAdapter, OutboundMessage, SendReceipt},
    circuit::{CircuitBreaker, CircuitConfig},
    error::{DeliveryError, Result},
    metrics::DeliveryMetrics,
    queue::JobQueue,
    reconcile::{finalize, reconcile, StoreIssue},
    retry::{AttemptDetail, RetryConfig, RetryManager, RetryOutcome, StopReason},
    store::DeliveryStore,
};

/// The breaker and retry policy owned by one channel.
#[derive(Debug)]
pub struct ChannelResilience {
    /// Breaker shared by every worker on the channel.
    pub breaker: CircuitBreaker,
    /// Retry policy shared by every worker on the channel.
    pub retry: RetryManager,
}

impl ChannelResilience {
    /// Creates the pair for `channel`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if either config is invalid.
    pub fn new(
        channel: Channel,
        circuit: CircuitConfig,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        circuit.validate()?;
        retry.validate()?;
        Ok(Self {
            breaker: CircuitBreaker::new(channel.as_str(), circuit, clock.clone()),
            retry: RetryManager::new(retry, clock),
        })
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The provider accepted the message.
    Sent(SendReceipt),
    /// Delivery definitively failed.
    Failed(DeliveryError),
    /// The record had already finished; nothing was sent.
    Skipped {
        /// Status found on the record.
        status: NotificationStatus,
    },
}

/// Everything that happened to one job.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Job and record id.
    pub notification_id: NotificationId,
    /// Channel used.
    pub channel: Channel,
    /// Delivery result.
    pub outcome: DeliveryOutcome,
    /// Provider attempts made.
    pub attempts: u32,
    /// Time from dequeue to finalize.
    pub delivery_time: Duration,
    /// Per-attempt trace from the retry manager.
    pub attempt_details: Vec<AttemptDetail>,
    /// Why retrying stopped, `None` for skipped jobs.
    pub stop_reason: Option<StopReason>,
    /// Swallowed store failures.
    pub store_issues: Vec<StoreIssue>,
    /// The final status write landed.
    pub record_finalized: bool,
}

impl DeliveryReport {
    /// Returns true when the provider accepted the message, whatever the
    /// store said.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Sent(_))
    }

    /// Final delivery error, if the job failed.
    pub fn error(&self) -> Option<&DeliveryError> {
        match &self.outcome {
            DeliveryOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Shared collaborators of every worker on one channel.
pub struct DeliveryPipeline {
    channel: Channel,
    adapter: Arc<dyn ChannelAdapter>,
    resilience: Arc<ChannelResilience>,
    store: Arc<dyn DeliveryStore>,
    events: Arc<dyn EventHandler>,
    metrics: Arc<DeliveryMetrics>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("channel", &self.channel)
            .field("provider", &self.adapter.provider())
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Creates a pipeline for the adapter's channel.
    pub fn new(
        adapter: Arc<dyn ChannelAdapter>,
        resilience: Arc<ChannelResilience>,
        store: Arc<dyn DeliveryStore>,
        events: Arc<dyn EventHandler>,
        metrics: Arc<DeliveryMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { channel: adapter.channel(), adapter, resilience, store, events, metrics, clock }
    }

    /// Channel served.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Breaker and retry policy of the channel.
    pub fn resilience(&self) -> &ChannelResilience {
        &self.resilience
    }

    /// Runs one job through reconcile, deliver, finalize, metrics and event.
    ///
    /// Never fails: every outcome, including store trouble, is in the report.
    pub async fn process_job(&self, job: DeliveryJob) -> DeliveryReport {
        let started = self.clock.now();
        let id = job.notification_id;

        let reconciliation = reconcile(&*self.store, &job, self.clock.now_utc()).await;
        let finished = reconciliation.status.filter(|status| status.is_terminal());
        let mut store_issues = reconciliation.issues;

        if let Some(status) = finished {
            warn!(
                notification_id = %id,
                channel = %self.channel,
                status = %status,
                "record already finished, skipping duplicate job"
            );
            self.metrics.record_skipped(self.channel).await;
            self.metrics.record_store_issues(self.channel, store_issues.len()).await;
            return DeliveryReport {
                notification_id: id,
                channel: self.channel,
                outcome: DeliveryOutcome::Skipped { status },
                attempts: 0,
                delivery_time: self.clock.now().duration_since(started),
                attempt_details: Vec::new(),
                stop_reason: None,
                store_issues,
                record_finalized: false,
            };
        }

        let message = OutboundMessage::from(&job);
        let RetryOutcome { result, attempts, attempt_details, stop_reason, .. } =
            self.deliver(&message).await;
        let delivery_time = self.clock.now().duration_since(started);
        let delivery_time_ms = u64::try_from(delivery_time.as_millis()).unwrap_or(u64::MAX);
        let provider = self.adapter.provider().to_string();
        let now = self.clock.now_utc();

        let (outcome, record_finalized) = match result {
            Ok(receipt) => {
                let update = NotificationUpdate::sent(
                    now,
                    attempts,
                    receipt.message_id.clone(),
                    receipt.cost,
                    receipt.response.clone(),
                );
                let finalized = finalize(&*self.store, id, update, &mut store_issues).await;

                self.metrics
                    .record_sent(
                        self.channel,
                        &receipt.provider,
                        delivery_time,
                        attempts,
                        receipt.cost,
                    )
                    .await;

                info!(
                    notification_id = %id,
                    channel = %self.channel,
                    provider = %receipt.provider,
                    attempts,
                    delivery_time_ms,
                    "notification sent"
                );

                self.events
                    .handle_event(NotificationEvent::Sent(NotificationSentEvent {
                        notification_id: id,
                        recipient_id: job.recipient.id.clone(),
                        channel: self.channel,
                        timestamp: now,
                        attempts,
                        delivery_time_ms,
                        cost: receipt.cost,
                        provider: receipt.provider.clone(),
                        external_message_id: receipt.message_id.clone(),
                    }))
                    .await;

                (DeliveryOutcome::Sent(receipt), finalized)
            },
            Err(error) => {
                let detail = failure_message(&error, &attempt_details);
                let update = NotificationUpdate::failed(detail.clone(), attempts);
                let finalized = finalize(&*self.store, id, update, &mut store_issues).await;

                self.metrics
                    .record_failed(self.channel, &provider, delivery_time, attempts, error.kind())
                    .await;

                warn!(
                    notification_id = %id,
                    channel = %self.channel,
                    provider = %provider,
                    attempts,
                    kind = %error.kind(),
                    error = %detail,
                    "notification failed"
                );

                self.events
                    .handle_event(NotificationEvent::Failed(NotificationFailedEvent {
                        notification_id: id,
                        recipient_id: job.recipient.id.clone(),
                        channel: self.channel,
                        timestamp: now,
                        attempts,
                        error: detail,
                        delivery_time_ms,
                        cost: None,
                        retriable: error.is_retriable(),
                    }))
                    .await;

                (DeliveryOutcome::Failed(error), finalized)
            },
        };

        self.metrics.record_store_issues(self.channel, store_issues.len()).await;

        DeliveryReport {
            notification_id: id,
            channel: self.channel,
            outcome,
            attempts,
            delivery_time,
            attempt_details,
            stop_reason: Some(stop_reason),
            store_issues,
            record_finalized,
        }
    }

    /// Retry outside, breaker inside, so every retry re-checks the circuit.
    async fn deliver(&self, message: &OutboundMessage) -> RetryOutcome<SendReceipt> {
        let breaker = &self.resilience.breaker;
        let adapter = &*self.adapter;

        self.resilience
            .retry
            .execute(move || async move {
                breaker.call(move || adapter.send(message)).await.into_result()
            })
            .await
    }
}

/// Error text persisted on a failed record. A global timeout keeps the last
/// provider error so operators see the cause, not just the ceiling.
fn failure_message(error: &DeliveryError, attempt_details: &[AttemptDetail]) -> String {
    match error {
        DeliveryError::GlobalTimeout { .. } => {
            match attempt_details.iter().rev().find_map(|detail| detail.error.as_ref()) {
                Some(last) => format!("{error}; last error: {last}"),
                None => error.to_string(),
            }
        },
        _ => error.to_string(),
    }
}

/// Worker pulling jobs for one channel until cancelled.
pub struct ChannelWorker {
    id: usize,
    pipeline: Arc<DeliveryPipeline>,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl ChannelWorker {
    /// Creates a worker.
    pub fn new(
        id: usize,
        pipeline: Arc<DeliveryPipeline>,
        queue: Arc<dyn JobQueue>,
        poll_interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, pipeline, queue, poll_interval, clock, cancellation_token }
    }

    /// Main worker loop: dequeues and processes jobs until cancelled.
    ///
    /// An in-flight job always runs to completion; cancellation is only
    /// observed between jobs and while idle.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the pool's join handles.
    pub async fn run(&self) -> Result<()> {
        let channel = self.pipeline.channel();
        info!(worker_id = self.id, channel = %channel, "channel worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(
                    worker_id = self.id,
                    channel = %channel,
                    "channel worker received shutdown signal"
                );
                break;
            }

            match self.queue.dequeue(channel).await {
                Some(job) => {
                    debug!(
                        worker_id = self.id,
                        notification_id = %job.notification_id,
                        "processing job"
                    );
                    self.pipeline.process_job(job).await;
                },
                None => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, channel = %channel, "channel worker stopped");
        Ok(())
    }
}
