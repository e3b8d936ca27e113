//! Delivery engine: channel workers plus the reminder sweeper.
//!
//! ```text
//! ┌────────────────┐   ┌─────────────┐   ┌──────────────────────────────┐
//! │ DeliveryEngine │──▶│ WorkerPool  │──▶│ retry ─▶ breaker ─▶ adapter  │
//! └────────────────┘   └─────────────┘   └──────────────────────────────┘
//!         │                   ▲
//!         ▼                   │ dequeue
//! ┌────────────────┐   ┌─────────────┐
//! │ReminderSweeper │──▶│  JobQueue   │
//! └────────────────┘   └─────────────┘
//! ```
//!
//! Every task shares one cancellation token. Shutdown cancels it and then
//! joins workers and sweeper within `shutdown_timeout`; in-flight jobs run
//! to completion.

use std::{sync::Arc, time::Duration};

use herald_core::{models::Channel, time::Clock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::JobQueue,
    reminder::ReminderProcessor,
    worker::DeliveryPipeline,
    worker_pool::WorkerPool,
};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workers spawned per channel.
    pub workers_per_channel: usize,
    /// Idle wait between empty dequeues.
    pub poll_interval: Duration,
    /// Time allowed for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers_per_channel: crate::DEFAULT_WORKERS_PER_CHANNEL,
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

/// Runs channel workers and the reminder sweeper.
pub struct DeliveryEngine {
    config: EngineConfig,
    pipelines: Vec<Arc<DeliveryPipeline>>,
    queue: Arc<dyn JobQueue>,
    reminders: Option<Arc<ReminderProcessor>>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    sweeper: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates an engine over `pipelines`, one per channel.
    pub fn new(
        config: EngineConfig,
        pipelines: Vec<Arc<DeliveryPipeline>>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            pipelines,
            queue,
            reminders: None,
            clock,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            sweeper: None,
        }
    }

    /// Also runs `processor` in a sweep loop while started.
    #[must_use]
    pub fn with_reminders(mut self, processor: Arc<ReminderProcessor>) -> Self {
        self.reminders = Some(processor);
        self
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Channels with a pipeline.
    pub fn channels(&self) -> Vec<Channel> {
        self.pipelines.iter().map(|pipeline| pipeline.channel()).collect()
    }

    /// Returns true between [`start`](Self::start) and shutdown while any
    /// worker runs.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Spawns the workers and the sweeper. Returns once they are spawned.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the engine was already
    /// started, has no channels, or would spawn no workers.
    pub fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }
        if self.pipelines.is_empty() {
            return Err(DeliveryError::configuration("no channel pipelines registered"));
        }

        info!(
            channels = ?self.channels(),
            workers_per_channel = self.config.workers_per_channel,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.pipelines.clone(),
            self.queue.clone(),
            self.config.workers_per_channel,
            self.config.poll_interval,
            self.clock.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers()?;
        self.worker_pool = Some(worker_pool);

        if let Some(processor) = self.reminders.clone() {
            let token = self.cancellation_token.clone();
            self.sweeper = Some(tokio::spawn(async move { processor.run(token).await }));
        }

        info!("delivery engine started");
        Ok(())
    }

    /// Stops accepting work and waits for in-flight jobs.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers or the sweeper
    /// outlive `shutdown_timeout`.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let started = tokio::time::Instant::now();
        let timeout = self.config.shutdown_timeout;

        let Some(worker_pool) = self.worker_pool.take() else {
            info!("delivery engine was not started, shutdown completed immediately");
            return Ok(());
        };
        let workers = worker_pool.shutdown_graceful(timeout).await;

        if let Some(sweeper) = self.sweeper.take() {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, sweeper).await {
                Ok(Ok(())) => {},
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "reminder sweeper panicked");
                },
                Err(_elapsed) => {
                    warn!("reminder sweeper did not stop within shutdown timeout");
                    workers?;
                    return Err(DeliveryError::ShutdownTimeout { timeout_secs: timeout.as_secs() });
                },
            }
        }

        workers?;
        info!("delivery engine stopped");
        Ok(())
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{
        events::RecordingEventHandler,
        models::{DeliveryJob, MessageContent, NotificationStatus, Recipient},
        time::RealClock,
    };

    use super::*;
    use crate::{
        adapter::{mock::ScriptedAdapter, ChannelAdapter},
        circuit::CircuitConfig,
        metrics::DeliveryMetrics,
        queue::InMemoryJobQueue,
        retry::RetryConfig,
        store::mock::MockDeliveryStore,
        worker::ChannelResilience,
    };

    struct Fixture {
        adapter: Arc<ScriptedAdapter>,
        store: Arc<MockDeliveryStore>,
        queue: Arc<InMemoryJobQueue>,
        engine: DeliveryEngine,
    }

    fn fixture(adapter: ScriptedAdapter, shutdown_timeout: Duration) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let adapter = Arc::new(adapter);
        let store = Arc::new(MockDeliveryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
        let resilience = Arc::new(
            ChannelResilience::new(
                adapter.channel(),
                CircuitConfig::for_provider(),
                RetryConfig::for_provider(),
                clock.clone(),
            )
            .expect("valid config"),
        );
        let pipeline = Arc::new(DeliveryPipeline::new(
            adapter.clone(),
            resilience,
            store.clone(),
            Arc::new(RecordingEventHandler::new()),
            Arc::new(DeliveryMetrics::new()),
            clock.clone(),
        ));
        let config = EngineConfig {
            workers_per_channel: 2,
            poll_interval: Duration::from_millis(5),
            shutdown_timeout,
        };
        let engine = DeliveryEngine::new(config, vec![pipeline], queue.clone(), clock);
        Fixture { adapter, store, queue, engine }
    }

    fn job(channel: Channel) -> DeliveryJob {
        DeliveryJob::new(
            channel,
            Recipient::new("guest-21", "guest21@example.com"),
            MessageContent::text("Your room is ready"),
        )
    }

    #[tokio::test]
    async fn delivers_queued_jobs_and_stops_cleanly() {
        let mut fx = fixture(ScriptedAdapter::new(Channel::Sms), Duration::from_secs(5));
        let job = job(Channel::Sms);
        let id = job.notification_id;
        fx.queue.enqueue(job).await.expect("enqueue");

        fx.engine.start().expect("start");
        assert!(fx.engine.is_running());

        for _ in 0..200 {
            if fx.store.status(id).await == Some(NotificationStatus::Sent) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.engine.shutdown().await.expect("clean shutdown");
        assert_eq!(fx.adapter.calls(), 1);
        assert_eq!(fx.store.status(id).await, Some(NotificationStatus::Sent));
    }

    #[tokio::test]
    async fn slow_in_flight_job_exceeds_shutdown_timeout() {
        let adapter = ScriptedAdapter::new(Channel::Email).with_latency(Duration::from_secs(10));
        let mut fx = fixture(adapter, Duration::from_millis(50));
        fx.queue.enqueue(job(Channel::Email)).await.expect("enqueue");

        fx.engine.start().expect("start");
        for _ in 0..200 {
            if fx.adapter.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = fx.engine.shutdown().await.expect_err("timeout");
        assert_eq!(err, DeliveryError::ShutdownTimeout { timeout_secs: 0 });
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mut fx = fixture(ScriptedAdapter::new(Channel::Chat), Duration::from_secs(5));
        fx.engine.start().expect("start");
        assert!(matches!(fx.engine.start(), Err(DeliveryError::Configuration { .. })));
        fx.engine.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let fx = fixture(ScriptedAdapter::new(Channel::Chat), Duration::from_secs(5));
        fx.engine.shutdown().await.expect("nothing to stop");
    }
}
