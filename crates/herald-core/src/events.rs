//! Notification lifecycle events and subscriber plumbing.
//!
//! Workers publish `notification.sent` and `notification.failed` events
//! after finalizing a job. Subscribers implement [`EventHandler`]; the
//! [`MulticastEventHandler`] fans a single event out to all of them.
//!
//! ```text
//! ┌───────────────┐  notification.sent   ┌────────────────────┐
//! │ ChannelWorker │ ───────────────────▶ │ MulticastHandler   │
//! │ (producer)    │  notification.failed │ (dispatcher)       │
//! └───────────────┘                      └────────────────────┘
//!                                                  │
//!                                   ┌──────────────┼──────────────┐
//!                                   ▼              ▼              ▼
//!                              analytics       webhooks       audit log
//! ```
//!
//! Handlers must never block or fail delivery; errors are theirs to log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::{Channel, NotificationId};

/// Events emitted by the delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    /// The provider accepted the message.
    #[serde(rename = "notification.sent")]
    Sent(NotificationSentEvent),

    /// Delivery definitively failed.
    #[serde(rename = "notification.failed")]
    Failed(NotificationFailedEvent),
}

impl NotificationEvent {
    /// Dotted event name as published to subscribers.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sent(_) => "notification.sent",
            Self::Failed(_) => "notification.failed",
        }
    }

    /// Notification the event refers to.
    pub fn notification_id(&self) -> NotificationId {
        match self {
            Self::Sent(event) => event.notification_id,
            Self::Failed(event) => event.notification_id,
        }
    }

    /// Channel the notification was sent on.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Sent(event) => event.channel,
            Self::Failed(event) => event.channel,
        }
    }
}

/// Payload of `notification.sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSentEvent {
    /// Notification that was delivered.
    pub notification_id: NotificationId,

    /// Recipient identifier.
    pub recipient_id: String,

    /// Channel used.
    pub channel: Channel,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Provider attempts made, including the successful one.
    pub attempts: u32,

    /// Wall time from dequeue to provider acceptance, in milliseconds.
    pub delivery_time_ms: u64,

    /// Provider-reported cost, if any.
    pub cost: Option<f64>,

    /// Provider that accepted the message.
    pub provider: String,

    /// Provider message id.
    pub external_message_id: Option<String>,
}

/// Payload of `notification.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFailedEvent {
    /// Notification that failed.
    pub notification_id: NotificationId,

    /// Recipient identifier.
    pub recipient_id: String,

    /// Channel used.
    pub channel: Channel,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Provider attempts made.
    pub attempts: u32,

    /// Last error observed.
    pub error: String,

    /// Wall time from dequeue to giving up, in milliseconds.
    pub delivery_time_ms: u64,

    /// Cost incurred, zero unless the provider billed a failed attempt.
    pub cost: Option<f64>,

    /// Whether the final error was retriable had budget remained.
    pub retriable: bool,
}

/// Trait for handling notification events.
///
/// Implementations should not block delivery processing. Failures are
/// logged by the handler itself and never propagated back to the worker.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a notification event.
    async fn handle_event(&self, event: NotificationEvent);
}

/// No-op event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: NotificationEvent) {}
}

/// Forwards events to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        tracing::trace!(
            event = event.name(),
            notification_id = %event.notification_id(),
            subscribers = self.handlers.len(),
            "dispatching notification event"
        );

        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Keeps every event it receives, in arrival order.
///
/// Useful for diagnostics endpoints and for asserting on emitted events.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.clone()
    }

    /// Returns the names of the recorded events.
    pub async fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(NotificationEvent::name).collect()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        self.events.lock().await.push(event);
    }
}
