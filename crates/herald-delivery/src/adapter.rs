//! Channel adapter boundary.
//!
//! An adapter performs the actual provider call for one channel and
//! classifies every failure into a [`DeliveryError`] before returning it.

use async_trait::async_trait;
use herald_core::models::{
    Channel, DeliveryJob, JobMetadata, MessageContent, NotificationId, Recipient,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Message handed to a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Notification being delivered; providers may use it as an
    /// idempotency key.
    pub notification_id: NotificationId,
    /// Channel the message goes out on.
    pub channel: Channel,
    /// Destination.
    pub recipient: Recipient,
    /// Body or template.
    pub content: MessageContent,
    /// Attachments, cc/bcc and trigger.
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl From<&DeliveryJob> for OutboundMessage {
    fn from(job: &DeliveryJob) -> Self {
        Self {
            notification_id: job.notification_id,
            channel: job.channel,
            recipient: job.recipient.clone(),
            content: job.content.clone(),
            metadata: job.metadata.clone(),
        }
    }
}

/// What a provider returns for an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider message id.
    pub message_id: Option<String>,
    /// Provider-reported cost.
    pub cost: Option<f64>,
    /// Provider name, for metrics.
    pub provider: String,
    /// Raw provider response.
    pub response: Option<serde_json::Value>,
}

/// Performs provider calls for one channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync + 'static {
    /// Channel this adapter serves.
    fn channel(&self) -> Channel;

    /// Provider name used in metrics and events.
    fn provider(&self) -> &str;

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns a classified `DeliveryError`; callers never inspect the
    /// message text.
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt>;
}

pub mod mock {
    //! Scripted adapter for tests.
    //!
    //! Replays queued results in order and falls back to a default
    //! response once the script runs out.

    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use herald_core::models::Channel;
    use tokio::sync::Mutex;

    use super::{ChannelAdapter, OutboundMessage, SendReceipt};
    use crate::error::{DeliveryError, Result};

    /// Adapter whose responses are queued up front.
    pub struct ScriptedAdapter {
        channel: Channel,
        provider: String,
        script: Arc<Mutex<VecDeque<Result<SendReceipt>>>>,
        fallback: Arc<Mutex<Result<SendReceipt>>>,
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
        calls: Arc<AtomicU32>,
        latency: Option<Duration>,
    }

    impl ScriptedAdapter {
        /// Creates an adapter that accepts every message.
        pub fn new(channel: Channel) -> Self {
            let provider = format!("mock-{channel}");
            Self {
                channel,
                fallback: Arc::new(Mutex::new(Ok(SendReceipt {
                    provider: provider.clone(),
                    ..SendReceipt::default()
                }))),
                provider,
                script: Arc::new(Mutex::new(VecDeque::new())),
                sent: Arc::new(Mutex::new(Vec::new())),
                calls: Arc::new(AtomicU32::new(0)),
                latency: None,
            }
        }

        /// Delays every response by `latency` of tokio time.
        #[must_use]
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        /// Queues a success.
        pub async fn push_ok(&self, message_id: impl Into<String>, cost: Option<f64>) {
            let receipt = SendReceipt {
                message_id: Some(message_id.into()),
                cost,
                provider: self.provider.clone(),
                response: Some(serde_json::json!({ "status": "accepted" })),
            };
            self.script.lock().await.push_back(Ok(receipt));
        }

        /// Queues a failure.
        pub async fn push_err(&self, error: DeliveryError) {
            self.script.lock().await.push_back(Err(error));
        }

        /// Fails every unscripted call with `error`.
        pub async fn fail_always(&self, error: DeliveryError) {
            *self.fallback.lock().await = Err(error);
        }

        /// Calls made so far.
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Messages the adapter was asked to send.
        pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn provider(&self) -> &str {
            &self.provider
        }

        async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().await.push(message.clone());

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let scripted = self.script.lock().await.pop_front();
            match scripted {
                Some(result) => result,
                None => self.fallback.lock().await.clone(),
            }
        }
    }
}
