//! Application context wiring every delivery component together.
//!
//! Created once at startup and passed around explicitly. The per-channel
//! pipelines and the reminder processor are built lazily behind a one-shot
//! async guard, so concurrent first callers share a single initialization.
//!
//! Jobs live in a volatile queue, but every job's record carries the job
//! itself. Initialization puts records still `pending` or `scheduled` from
//! a previous run back on the queue before this process enqueues anything.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{
    events::{EventHandler, NoOpEventHandler},
    models::{
        Channel, DeliveryJob, NotificationId, NotificationRecord, NotificationUpdate, Recipient,
        ReminderId, ReminderType,
    },
    time::Clock,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    adapter::ChannelAdapter,
    circuit::{BreakerHealth, CircuitConfig},
    engine::{DeliveryEngine, EngineConfig},
    error::{DeliveryError, Result},
    metrics::DeliveryMetrics,
    queue::{InMemoryJobQueue, JobQueue},
    reminder::{ReminderConfig, ReminderProcessor, SweepReport},
    retry::RetryConfig,
    store::{DeliveryStore, GuardedDeliveryStore, ReminderStore},
    worker::{ChannelResilience, DeliveryPipeline, DeliveryReport},
};

/// Error recorded on records abandoned in `sending`.
pub const OUTCOME_UNKNOWN_ERROR: &str =
    "delivery outcome unknown: worker stopped while the message was being sent";

/// Error recorded on owed records whose job can no longer be rebuilt.
pub const UNRECOVERABLE_JOB_ERROR: &str = "job payload missing, record cannot be re-enqueued";

/// Records examined per stale-sending recovery pass.
const STALE_SENDING_BATCH: usize = 500;

/// Owed records re-enqueued on initialization at most.
const OWED_REQUEUE_LIMIT: usize = 10_000;

/// Time allowed on top of the retry ceiling for the final record write.
const FINALIZE_SLACK: Duration = Duration::from_secs(30);

/// Settings for the whole delivery stack.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Worker pool settings.
    pub engine: EngineConfig,
    /// Retry policy of every channel.
    pub retry: RetryConfig,
    /// Breaker tuning of every provider.
    pub provider_circuit: CircuitConfig,
    /// Breaker tuning of the delivery store.
    pub store_circuit: CircuitConfig,
    /// Reminder sweep settings.
    pub reminders: ReminderConfig,
    /// Re-enqueue records left `pending` or `scheduled` on initialization.
    /// Turn off for a queue that survives restarts on its own.
    pub requeue_owed: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            provider_circuit: CircuitConfig::default(),
            store_circuit: CircuitConfig::default(),
            reminders: ReminderConfig::default(),
            requeue_owed: true,
        }
    }
}

struct Services {
    pipelines: BTreeMap<Channel, Arc<DeliveryPipeline>>,
    reminders: Arc<ReminderProcessor>,
    requeued: usize,
}

/// Explicitly passed application context.
pub struct AppContext {
    config: ContextConfig,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    store: Arc<GuardedDeliveryStore>,
    reminder_store: Arc<dyn ReminderStore>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventHandler>,
    metrics: Arc<DeliveryMetrics>,
    clock: Arc<dyn Clock>,
    services: OnceCell<Services>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("channels", &self.adapters.iter().map(|a| a.channel()).collect::<Vec<_>>())
            .field("initialized", &self.services.initialized())
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Creates a context with no adapters and no event subscribers.
    pub fn new(
        config: ContextConfig,
        store: Arc<dyn DeliveryStore>,
        reminder_store: Arc<dyn ReminderStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store =
            Arc::new(GuardedDeliveryStore::new(store, config.store_circuit.clone(), clock.clone()));
        Self {
            queue: Arc::new(InMemoryJobQueue::new(clock.clone())),
            config,
            adapters: Vec::new(),
            store,
            reminder_store,
            events: Arc::new(NoOpEventHandler),
            metrics: Arc::new(DeliveryMetrics::new()),
            clock,
            services: OnceCell::new(),
        }
    }

    /// Registers the adapter serving its channel. A later adapter for the
    /// same channel replaces the earlier one.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.retain(|existing| existing.channel() != adapter.channel());
        self.adapters.push(adapter);
        self
    }

    /// Replaces the in-process queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the receiver of `notification.sent` and `notification.failed`.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Builds the pipelines and reminder processor, then re-enqueues the
    /// records a previous run still owed a delivery. Runs once; later calls
    /// return immediately. Any other operation initializes on first use.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for invalid policies, no
    /// adapters, or a reminder channel without an adapter.
    pub async fn initialize(&self) -> Result<()> {
        self.services().await.map(|_| ())
    }

    /// Jobs re-enqueued from owed records during initialization, `None`
    /// before it ran.
    pub fn requeued_on_start(&self) -> Option<usize> {
        self.services.get().map(|services| services.requeued)
    }

    async fn services(&self) -> Result<&Services> {
        self.services
            .get_or_try_init(|| async {
                let mut services = self.build_services()?;
                if self.config.requeue_owed {
                    services.requeued = self.requeue_owed(&services.pipelines).await;
                }
                Ok(services)
            })
            .await
    }

    fn build_services(&self) -> Result<Services> {
        if self.adapters.is_empty() {
            return Err(DeliveryError::configuration("no channel adapters registered"));
        }

        let mut pipelines = BTreeMap::new();
        for adapter in &self.adapters {
            let channel = adapter.channel();
            let resilience = Arc::new(ChannelResilience::new(
                channel,
                self.config.provider_circuit.clone(),
                self.config.retry.clone(),
                self.clock.clone(),
            )?);
            let pipeline = DeliveryPipeline::new(
                adapter.clone(),
                resilience,
                self.store.clone(),
                self.events.clone(),
                self.metrics.clone(),
                self.clock.clone(),
            );
            pipelines.insert(channel, Arc::new(pipeline));
        }

        if let Some(missing) =
            self.config.reminders.channels.iter().find(|channel| !pipelines.contains_key(channel))
        {
            return Err(DeliveryError::configuration(format!(
                "reminder channel {missing} has no adapter"
            )));
        }

        let reminders = Arc::new(ReminderProcessor::new(
            self.config.reminders.clone(),
            self.reminder_store.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
        )?);

        info!(channels = ?pipelines.keys().collect::<Vec<_>>(), "application context initialized");
        Ok(Services { pipelines, reminders, requeued: 0 })
    }

    /// Puts owed records back on the queue. Store failures are logged; the
    /// records stay owed for the next start.
    async fn requeue_owed(&self, pipelines: &BTreeMap<Channel, Arc<DeliveryPipeline>>) -> usize {
        let owed = match self.store.find_owed(OWED_REQUEUE_LIMIT).await {
            Ok(owed) => owed,
            Err(e) => {
                warn!(error = %e, "failed to look up owed notification records");
                return 0;
            },
        };
        if owed.len() == OWED_REQUEUE_LIMIT {
            warn!(limit = OWED_REQUEUE_LIMIT, "owed records hit the re-enqueue limit");
        }

        let mut requeued = 0;
        for record in owed {
            if !pipelines.contains_key(&record.channel) {
                debug!(
                    notification_id = %record.id,
                    channel = %record.channel,
                    "owed record has no adapter here, left for another instance"
                );
                continue;
            }
            let Some(job) = record.to_job() else {
                self.close_unrecoverable(&record).await;
                continue;
            };
            match self.queue.enqueue(job).await {
                Ok(()) => requeued += 1,
                Err(e) => {
                    warn!(
                        notification_id = %record.id,
                        error = %e,
                        "failed to re-enqueue owed job"
                    );
                },
            }
        }

        if requeued > 0 {
            info!(requeued, "re-enqueued jobs owed by a previous run");
        }
        requeued
    }

    async fn close_unrecoverable(&self, record: &NotificationRecord) {
        let attempts = u32::try_from(record.attempts).unwrap_or(0);
        let update = NotificationUpdate::failed(UNRECOVERABLE_JOB_ERROR, attempts);
        match self.store.update(record.id, update).await {
            Ok(true) => {
                warn!(notification_id = %record.id, "owed record without job marked failed");
            },
            Ok(false) => {},
            Err(e) => {
                warn!(notification_id = %record.id, error = %e, "failed to close owed record");
            },
        }
    }

    async fn pipeline(&self, channel: Channel) -> Result<Arc<DeliveryPipeline>> {
        self.services()
            .await?
            .pipelines
            .get(&channel)
            .cloned()
            .ok_or_else(|| DeliveryError::configuration(format!("no adapter for channel {channel}")))
    }

    /// Records the job and hands it to the channel workers.
    ///
    /// The record starts `pending`, or `scheduled` when the job is
    /// future-dated. A failed record write is logged; the worker creates
    /// the record on pickup.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for a channel without an
    /// adapter and `DeliveryError::ShutdownRequested` once the queue is
    /// closed.
    pub async fn submit(&self, job: DeliveryJob) -> Result<NotificationId> {
        self.pipeline(job.channel).await?;
        if self.queue.is_closed().await {
            return Err(DeliveryError::ShutdownRequested);
        }
        let id = job.notification_id;

        match self.store.create(job.to_record(self.clock.now_utc())).await {
            Ok(true) => {},
            Ok(false) => warn!(notification_id = %id, "notification record already exists"),
            Err(e) => {
                warn!(notification_id = %id, error = %e, "failed to create notification record");
            },
        }

        self.queue.enqueue(job).await?;
        Ok(id)
    }

    /// Runs the full lifecycle for `job` on the calling task.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for a channel without an
    /// adapter. Delivery failures are reported in the envelope, not here.
    pub async fn send_now(&self, job: DeliveryJob) -> Result<DeliveryReport> {
        let pipeline = self.pipeline(job.channel).await?;
        Ok(pipeline.process_job(job).await)
    }

    /// Creates reminders for a booked event.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization or the store fails.
    pub async fn schedule_reminders(
        &self,
        booking_ref: &str,
        recipient: &Recipient,
        event_at: DateTime<Utc>,
        reminder_types: &[ReminderType],
    ) -> Result<Vec<ReminderId>> {
        let reminders = &self.services().await?.reminders;
        reminders.schedule(booking_ref, recipient, event_at, reminder_types).await
    }

    /// Cancels a reminder that has not fired.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization or the store fails.
    pub async fn cancel_reminder(&self, id: ReminderId) -> Result<bool> {
        self.services().await?.reminders.cancel(id).await
    }

    /// Runs one reminder sweep now.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub async fn sweep_reminders(&self) -> Result<SweepReport> {
        Ok(self.services().await?.reminders.sweep().await)
    }

    /// Breaker state of every channel.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub async fn breaker_health(&self) -> Result<BTreeMap<Channel, BreakerHealth>> {
        let mut health = BTreeMap::new();
        for (channel, pipeline) in &self.services().await?.pipelines {
            health.insert(*channel, pipeline.resilience().breaker.health().await);
        }
        Ok(health)
    }

    /// Breaker state of the delivery store.
    pub async fn store_health(&self) -> BreakerHealth {
        self.store.breaker().health().await
    }

    /// Marks records stuck in `sending` for longer than `older_than` as
    /// failed with an "outcome unknown" error. Nothing is re-sent. Returns
    /// the number of records closed out.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the lookup fails. Individual update
    /// failures are logged and skipped.
    pub async fn recover_stale_sending(&self, older_than: Duration) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| DeliveryError::configuration(format!("invalid staleness window: {e}")))?;
        let cutoff = self.clock.now_utc() - older_than;
        let stale = self.store.find_stale_sending(cutoff, STALE_SENDING_BATCH).await?;

        let mut recovered = 0;
        for record in stale {
            let attempts = u32::try_from(record.attempts).unwrap_or(0);
            let update = NotificationUpdate::failed(OUTCOME_UNKNOWN_ERROR, attempts);
            match self.store.update(record.id, update).await {
                Ok(true) => {
                    warn!(
                        notification_id = %record.id,
                        channel = %record.channel,
                        stuck_since = %record.updated_at,
                        "stale sending record marked failed"
                    );
                    recovered += 1;
                },
                Ok(false) => {},
                Err(e) => {
                    warn!(notification_id = %record.id, error = %e, "failed to close stale record");
                },
            }
        }

        info!(recovered, "stale sending recovery finished");
        Ok(recovered)
    }

    /// Engine running workers for every channel plus the reminder sweeper.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub async fn engine(&self) -> Result<DeliveryEngine> {
        let services = self.services().await?;
        let config = EngineConfig {
            shutdown_timeout: self.shutdown_timeout(),
            ..self.config.engine.clone()
        };
        let engine = DeliveryEngine::new(
            config,
            services.pipelines.values().cloned().collect(),
            self.queue.clone(),
            self.clock.clone(),
        )
        .with_reminders(services.reminders.clone());
        Ok(engine)
    }

    /// Shutdown window long enough for an in-flight retry sequence to end
    /// and be written down. A job cut off mid-send stays `sending` and is
    /// never retried, so the configured window is raised to the retry
    /// ceiling plus [`FINALIZE_SLACK`].
    fn shutdown_timeout(&self) -> Duration {
        let configured = self.config.engine.shutdown_timeout;
        let Some(ceiling) = self.config.retry.global_timeout else {
            return configured;
        };
        let floor = ceiling.saturating_add(FINALIZE_SLACK);
        if configured < floor {
            warn!(
                configured_secs = configured.as_secs(),
                raised_to_secs = floor.as_secs(),
                "shutdown timeout shorter than the retry ceiling, raising it"
            );
            return floor;
        }
        configured
    }

    /// Rejects further submissions. Already queued jobs still drain.
    pub async fn close(&self) {
        self.queue.close().await;
    }

    /// Delivery counters.
    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    /// The job queue.
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }
}
