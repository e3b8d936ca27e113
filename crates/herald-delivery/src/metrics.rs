//! Per-channel delivery counters.
//!
//! Recorded by workers after every job regardless of how the store writes
//! went, so the numbers reflect what providers actually did.

use std::{collections::BTreeMap, time::Duration};

use herald_core::models::Channel;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::ErrorKind;

/// Outcome counts for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    /// Accepted messages.
    pub sent: u64,
    /// Messages that finally failed.
    pub failed: u64,
}

/// Counters for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    /// Accepted messages.
    pub sent: u64,
    /// Messages that finally failed.
    pub failed: u64,
    /// Jobs skipped because their record was already terminal.
    pub skipped: u64,
    /// Provider attempts across all jobs.
    pub attempts: u64,
    /// Store operations that failed and were swallowed.
    pub store_issues: u64,
    /// Sum of per-job delivery time.
    pub total_latency_ms: u64,
    /// Slowest job.
    pub max_latency_ms: u64,
    /// Sum of provider-reported cost.
    pub total_cost: f64,
    /// Counts per provider.
    pub providers: BTreeMap<String, ProviderStats>,
    /// Final failures per error kind.
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
}

impl ChannelStats {
    /// Mean delivery time over sent and failed jobs.
    pub fn average_latency_ms(&self) -> u64 {
        let jobs = self.sent + self.failed;
        if jobs == 0 {
            0
        } else {
            self.total_latency_ms / jobs
        }
    }

    fn record_latency(&mut self, latency: Duration, attempts: u32) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.total_latency_ms = self.total_latency_ms.saturating_add(ms);
        self.max_latency_ms = self.max_latency_ms.max(ms);
        self.attempts += u64::from(attempts);
    }
}

/// Delivery counters for every channel.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    channels: RwLock<BTreeMap<Channel, ChannelStats>>,
}

impl DeliveryMetrics {
    /// Creates empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted message.
    pub async fn record_sent(
        &self,
        channel: Channel,
        provider: &str,
        latency: Duration,
        attempts: u32,
        cost: Option<f64>,
    ) {
        let mut channels = self.channels.write().await;
        let stats = channels.entry(channel).or_default();
        stats.sent += 1;
        stats.record_latency(latency, attempts);
        stats.total_cost += cost.unwrap_or(0.0);
        stats.providers.entry(provider.to_string()).or_default().sent += 1;
    }

    /// Records a message that finally failed.
    pub async fn record_failed(
        &self,
        channel: Channel,
        provider: &str,
        latency: Duration,
        attempts: u32,
        kind: ErrorKind,
    ) {
        let mut channels = self.channels.write().await;
        let stats = channels.entry(channel).or_default();
        stats.failed += 1;
        stats.record_latency(latency, attempts);
        *stats.failures_by_kind.entry(kind).or_default() += 1;
        stats.providers.entry(provider.to_string()).or_default().failed += 1;
    }

    /// Records a job that was not delivered because its record was terminal.
    pub async fn record_skipped(&self, channel: Channel) {
        self.channels.write().await.entry(channel).or_default().skipped += 1;
    }

    /// Records swallowed store failures.
    pub async fn record_store_issues(&self, channel: Channel, count: usize) {
        if count == 0 {
            return;
        }
        let mut channels = self.channels.write().await;
        channels.entry(channel).or_default().store_issues += count as u64;
    }

    /// Counters for one channel.
    pub async fn channel(&self, channel: Channel) -> ChannelStats {
        self.channels.read().await.get(&channel).cloned().unwrap_or_default()
    }

    /// Counters for every channel that saw traffic.
    pub async fn snapshot(&self) -> BTreeMap<Channel, ChannelStats> {
        self.channels.read().await.clone()
    }
}
