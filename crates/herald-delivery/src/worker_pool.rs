//! Supervised channel worker tasks.
//!
//! The pool spawns a fixed number of [`ChannelWorker`]s per channel pipeline,
//! all sharing one cancellation token, and joins them on shutdown within a
//! time budget.

use std::{sync::Arc, time::Duration};

use herald_core::time::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::JobQueue,
    worker::{ChannelWorker, DeliveryPipeline},
};

/// Worker tasks for every registered channel.
pub struct WorkerPool {
    pipelines: Vec<Arc<DeliveryPipeline>>,
    queue: Arc<dyn JobQueue>,
    workers_per_channel: usize,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool; nothing runs until [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        pipelines: Vec<Arc<DeliveryPipeline>>,
        queue: Arc<dyn JobQueue>,
        workers_per_channel: usize,
        poll_interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            pipelines,
            queue,
            workers_per_channel,
            poll_interval,
            clock,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns `workers_per_channel` workers for each pipeline.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when no worker would run.
    pub fn spawn_workers(&mut self) -> Result<()> {
        if self.workers_per_channel == 0 {
            return Err(DeliveryError::configuration("workers_per_channel must be positive"));
        }

        let mut worker_id = 0;
        for pipeline in &self.pipelines {
            for _ in 0..self.workers_per_channel {
                let worker = ChannelWorker::new(
                    worker_id,
                    pipeline.clone(),
                    self.queue.clone(),
                    self.poll_interval,
                    self.clock.clone(),
                    self.cancellation_token.clone(),
                );
                let channel = pipeline.channel();

                let handle = tokio::spawn(async move {
                    let result = worker.run().await;
                    if let Err(ref error) = result {
                        error!(
                            worker_id,
                            channel = %channel,
                            error = %error,
                            "channel worker terminated with error"
                        );
                    }
                    result
                });

                self.worker_handles.push(handle);
                worker_id += 1;
            }
        }

        info!(
            channels = self.pipelines.len(),
            spawned_workers = self.worker_handles.len(),
            "channel workers spawned"
        );
        Ok(())
    }

    /// Number of spawned workers, finished or not.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Returns true if any worker is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }

    /// Cancels every worker and waits for in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the workers do not stop
    /// within `timeout`. They keep running detached in that case.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        let join_all = async move {
            let mut panics = Vec::new();
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        panics.push(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }
            panics
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(panics) => match panics.into_iter().next() {
                None => {
                    info!("worker pool shutdown completed");
                    Ok(())
                },
                Some(first) => Err(first),
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_secs: timeout.as_secs() })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|handle| !handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
