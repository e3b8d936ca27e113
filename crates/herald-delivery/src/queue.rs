//! Per-channel job queue.
//!
//! Jobs are released only once due. Among due jobs the highest priority
//! goes first, and equal priorities keep submission order. Each channel
//! keeps its jobs in submission order and `dequeue` scans for the best due
//! one, since a not-yet-due head must not block due jobs behind it.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use herald_core::{
    models::{Channel, DeliveryJob, Priority},
    time::Clock,
};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{DeliveryError, Result};

/// Queue feeding channel workers.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Adds a job to its channel's queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownRequested` once the queue is closed.
    async fn enqueue(&self, job: DeliveryJob) -> Result<()>;

    /// Takes the next due job for `channel`, if any.
    async fn dequeue(&self, channel: Channel) -> Option<DeliveryJob>;

    /// Jobs waiting on `channel`, due or not.
    async fn depth(&self, channel: Channel) -> usize;

    /// Rejects further enqueues. Jobs already queued can still be taken.
    async fn close(&self);

    /// Returns true once [`close`](Self::close) was called.
    async fn is_closed(&self) -> bool;
}

struct Entry {
    seq: u64,
    job: DeliveryJob,
}

#[derive(Default)]
struct QueueState {
    channels: HashMap<Channel, Vec<Entry>>,
    next_seq: u64,
    closed: bool,
}

/// In-process queue.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobQueue").finish_non_exhaustive()
    }
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(QueueState::default()), clock }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: DeliveryJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(DeliveryError::ShutdownRequested);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        trace!(
            notification_id = %job.notification_id,
            channel = %job.channel,
            seq,
            "job enqueued"
        );
        state.channels.entry(job.channel).or_default().push(Entry { seq, job });
        Ok(())
    }

    async fn dequeue(&self, channel: Channel) -> Option<DeliveryJob> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        let entries = state.channels.get_mut(&channel)?;

        let mut best: Option<(usize, Priority, u64)> = None;
        for (index, entry) in entries.iter().enumerate() {
            if !entry.job.is_due(now) {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, priority, seq)) => {
                    entry.job.priority > priority
                        || (entry.job.priority == priority && entry.seq < seq)
                },
            };
            if better {
                best = Some((index, entry.job.priority, entry.seq));
            }
        }

        best.map(|(index, _, _)| entries.remove(index).job)
    }

    async fn depth(&self, channel: Channel) -> usize {
        self.state.lock().await.channels.get(&channel).map_or(0, Vec::len)
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use herald_core::{
        models::{MessageContent, Recipient},
        time::TestClock,
    };

    use super::*;

    fn body(job: &DeliveryJob) -> &str {
        match &job.content {
            MessageContent::Inline { body, .. } => body,
            MessageContent::Template { template_ref, .. } => template_ref,
        }
    }

    struct Fixture {
        queue: InMemoryJobQueue,
        clock: TestClock,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = TestClock::with_start_time(SystemTime::now());
            Self { queue: InMemoryJobQueue::new(Arc::new(clock.clone())), clock }
        }

        // Jobs are stamped with the test clock so they are due immediately.
        fn job(&self, channel: Channel, body: &str) -> DeliveryJob {
            DeliveryJob::new(
                channel,
                Recipient::new("guest", "guest@example.com"),
                MessageContent::text(body),
            )
            .scheduled_for(self.clock.now_utc())
        }
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let fx = Fixture::new();
        let queue = &fx.queue;
        queue.enqueue(fx.job(Channel::Email, "first-normal")).await.expect("enqueue");
        let bulk = fx.job(Channel::Email, "bulk").with_priority(Priority::Low);
        queue.enqueue(bulk).await.expect("enqueue");
        queue.enqueue(fx.job(Channel::Email, "second-normal")).await.expect("enqueue");
        let alert = fx.job(Channel::Email, "alert").with_priority(Priority::Urgent);
        queue.enqueue(alert).await.expect("enqueue");

        let mut order = Vec::new();
        while let Some(job) = queue.dequeue(Channel::Email).await {
            order.push(body(&job).to_string());
        }
        assert_eq!(order, vec!["alert", "first-normal", "second-normal", "bulk"]);
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let fx = Fixture::new();
        let queue = &fx.queue;
        queue.enqueue(fx.job(Channel::Sms, "sms")).await.expect("enqueue");

        assert!(queue.dequeue(Channel::Email).await.is_none());
        assert_eq!(queue.depth(Channel::Sms).await, 1);
        assert!(queue.dequeue(Channel::Sms).await.is_some());
    }

    #[tokio::test]
    async fn future_jobs_wait_until_due() {
        let fx = Fixture::new();
        let queue = &fx.queue;
        let later = fx.clock.now_utc() + chrono::Duration::minutes(5);
        queue.enqueue(fx.job(Channel::Chat, "later").scheduled_for(later)).await.expect("enqueue");

        assert!(queue.dequeue(Channel::Chat).await.is_none());
        fx.clock.advance(Duration::from_secs(301));
        assert!(queue.dequeue(Channel::Chat).await.is_some());
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_jobs() {
        let fx = Fixture::new();
        let queue = &fx.queue;
        queue.enqueue(fx.job(Channel::Email, "kept")).await.expect("enqueue");
        queue.close().await;

        let err = queue.enqueue(fx.job(Channel::Email, "late")).await.expect_err("closed");
        assert_eq!(err, DeliveryError::ShutdownRequested);
        assert!(queue.dequeue(Channel::Email).await.is_some());
    }
}
