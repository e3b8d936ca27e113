//! HTTP channel adapter for JSON provider APIs.
//!
//! Posts each [`OutboundMessage`] as JSON to the provider endpoint and
//! classifies the response: transport failures become connection or timeout
//! errors, non-2xx statuses go through
//! [`DeliveryError::from_provider_status`].

use std::time::Duration;

use async_trait::async_trait;
use herald_core::models::Channel;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    adapter::{ChannelAdapter, OutboundMessage, SendReceipt},
    error::{DeliveryError, Result},
};

/// Largest error body kept in a `DeliveryError`.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration for an HTTP provider client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport timeout for one request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Bearer token sent to the provider.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Herald-Notifications/1.0".to_string(),
            api_key: None,
        }
    }
}

/// Channel adapter speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChannelAdapter {
    client: reqwest::Client,
    channel: Channel,
    provider: String,
    endpoint: String,
    config: ClientConfig,
}

impl HttpChannelAdapter {
    /// Creates an adapter posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(
        channel: Channel,
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, channel, provider: provider.into(), endpoint: endpoint.into(), config })
    }

    fn classify_transport_error(&self, err: &reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::timeout(self.config.timeout)
        } else if err.is_connect() {
            DeliveryError::connection(format!("connection failed: {err}"))
        } else {
            DeliveryError::connection(err.to_string())
        }
    }
}

#[async_trait]
impl ChannelAdapter for HttpChannelAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt> {
        let span = info_span!(
            "provider_send",
            notification_id = %message.notification_id,
            channel = %self.channel,
            provider = %self.provider,
        );

        async move {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header("X-Herald-Notification-Id", message.notification_id.to_string())
                .json(message);
            if let Some(api_key) = &self.config.api_key {
                request = request.bearer_auth(api_key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "provider request failed");
                    return Err(self.classify_transport_error(&e));
                },
            };

            let status = response.status();
            let retry_hint = retry_after(response.headers());
            let bytes = response.bytes().await.map_err(|e| self.classify_transport_error(&e))?;

            if !status.is_success() {
                let body = truncate(&String::from_utf8_lossy(&bytes));
                warn!(status = status.as_u16(), "provider rejected message");
                return Err(DeliveryError::from_provider_status(status.as_u16(), body, retry_hint));
            }

            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            });
            let acceptance = ProviderAcceptance::from_body(&body);
            debug!(
                status = status.as_u16(),
                message_id = ?acceptance.message_id,
                "provider accepted message"
            );

            Ok(SendReceipt {
                message_id: acceptance.message_id,
                cost: acceptance.cost,
                provider: self.provider.clone(),
                response: Some(body),
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Default)]
struct ProviderAcceptance {
    message_id: Option<String>,
    cost: Option<f64>,
}

impl ProviderAcceptance {
    fn from_body(body: &serde_json::Value) -> Self {
        let message_id = body
            .get("message_id")
            .or_else(|| body.get("id"))
            .and_then(|id| match id {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let cost = body.get("cost").and_then(serde_json::Value::as_f64);
        Self { message_id, cost }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

/// Reads a `Retry-After` header in either delta-seconds or HTTP-date form.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&chrono::Utc);
    (at - chrono::Utc::now()).to_std().ok()
}
