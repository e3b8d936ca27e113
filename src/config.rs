//! Configuration for the Herald delivery service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_core::models::Channel;
use herald_delivery::{
    client::ClientConfig, CircuitConfig, ContextConfig, EngineConfig, ReminderConfig, RetryConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Service configuration with defaults, file, and environment overrides.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed `HERALD_` (e.g. `HERALD_DATABASE_URL`)
/// 2. `herald.toml` in the working directory
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum connections in the pool.
    pub database_max_connections: u32,
    /// Connections kept open while idle.
    pub database_min_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub database_acquire_timeout_secs: u64,

    // Workers
    /// Workers spawned per channel.
    pub workers_per_channel: usize,
    /// Idle wait between empty dequeues.
    pub poll_interval_ms: u64,
    /// Time allowed for in-flight jobs on shutdown.
    pub shutdown_timeout_secs: u64,

    // Retry
    /// Retries after the first attempt.
    pub retry_max_retries: u32,
    /// Delay before the first retry.
    pub retry_initial_delay_ms: u64,
    /// Cap on any single retry delay.
    pub retry_max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub retry_backoff_multiplier: f64,
    /// Spread delays by up to 25% either way.
    pub retry_jitter: bool,
    /// Ceiling on a whole retry sequence, `0` for none.
    pub retry_global_timeout_ms: u64,

    // Provider breakers
    /// Consecutive failures that open a provider circuit.
    pub provider_failure_threshold: u32,
    /// Per-call provider timeout.
    pub provider_timeout_ms: u64,
    /// Time an open provider circuit waits before a trial call.
    pub provider_reset_timeout_ms: u64,

    // Store breaker
    /// Consecutive failures that open the store circuit.
    pub store_failure_threshold: u32,
    /// Per-call store timeout.
    pub store_timeout_ms: u64,
    /// Time an open store circuit waits before a trial call.
    pub store_reset_timeout_ms: u64,

    // Reminders
    /// Seconds between reminder sweeps.
    pub reminder_sweep_interval_secs: u64,
    /// Reminders fired per sweep at most.
    pub reminder_batch_size: usize,
    /// Hours a reminder may stay in processing before it expires.
    pub reminder_expiry_hours: u64,
    /// Channels every reminder is sent on.
    pub reminder_channels: Vec<Channel>,

    // Providers
    /// Email provider endpoint.
    pub email_provider_url: Option<String>,
    /// SMS gateway endpoint.
    pub sms_provider_url: Option<String>,
    /// Chat provider endpoint.
    pub chat_provider_url: Option<String>,
    /// Bearer token sent to every provider.
    #[serde(skip_serializing)]
    pub provider_api_key: Option<String>,

    // Operations
    /// When set, records stuck in `sending` longer than this many seconds
    /// are marked failed once at startup.
    pub recover_stale_sending_after_secs: Option<u64>,
    /// Re-enqueue records left `pending` or `scheduled` by a previous run.
    pub requeue_owed_on_start: bool,
    /// `text` or `json`.
    pub log_format: String,
}

impl Config {
    /// Loads defaults, then `herald.toml`, then `HERALD_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy shared by every channel.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            jitter_enabled: self.retry_jitter,
            global_timeout: (self.retry_global_timeout_ms > 0)
                .then(|| Duration::from_millis(self.retry_global_timeout_ms)),
            ..RetryConfig::default()
        }
    }

    /// Breaker tuning for providers.
    pub fn to_provider_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.provider_failure_threshold,
            timeout: Duration::from_millis(self.provider_timeout_ms),
            reset_timeout: Duration::from_millis(self.provider_reset_timeout_ms),
            ..CircuitConfig::default()
        }
    }

    /// Breaker tuning for the delivery store.
    pub fn to_store_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.store_failure_threshold,
            timeout: Duration::from_millis(self.store_timeout_ms),
            reset_timeout: Duration::from_millis(self.store_reset_timeout_ms),
            ..CircuitConfig::default()
        }
    }

    /// Worker pool settings.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers_per_channel: self.workers_per_channel,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Reminder sweep settings.
    pub fn to_reminder_config(&self) -> ReminderConfig {
        ReminderConfig {
            sweep_interval: Duration::from_secs(self.reminder_sweep_interval_secs),
            batch_size: self.reminder_batch_size,
            expiry_window: Duration::from_secs(self.reminder_expiry_hours * 60 * 60),
            channels: self.reminder_channels.clone(),
            ..ReminderConfig::default()
        }
    }

    /// Everything the delivery context needs.
    pub fn to_context_config(&self) -> ContextConfig {
        ContextConfig {
            engine: self.to_engine_config(),
            retry: self.to_retry_config(),
            provider_circuit: self.to_provider_circuit_config(),
            store_circuit: self.to_store_circuit_config(),
            reminders: self.to_reminder_config(),
            requeue_owed: self.requeue_owed_on_start,
        }
    }

    /// HTTP client settings for provider adapters. The transport timeout
    /// matches the provider breaker's call timeout.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(self.provider_timeout_ms),
            api_key: self.provider_api_key.clone(),
            ..ClientConfig::default()
        }
    }

    /// Configured provider endpoints, one per channel.
    pub fn provider_endpoints(&self) -> Vec<(Channel, String)> {
        [
            (Channel::Email, &self.email_provider_url),
            (Channel::Sms, &self.sms_provider_url),
            (Channel::Chat, &self.chat_provider_url),
        ]
        .into_iter()
        .filter_map(|(channel, url)| url.clone().map(|url| (channel, url)))
        .collect()
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }
        if self.workers_per_channel == 0 {
            anyhow::bail!("workers_per_channel must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }
        if self.reminder_expiry_hours == 0 {
            anyhow::bail!("reminder_expiry_hours must be greater than 0");
        }
        if self.log_format != "text" && self.log_format != "json" {
            anyhow::bail!("log_format must be \"text\" or \"json\"");
        }

        self.to_retry_config().validate().context("invalid retry settings")?;
        self.to_provider_circuit_config().validate().context("invalid provider breaker settings")?;
        self.to_store_circuit_config().validate().context("invalid store breaker settings")?;
        self.to_reminder_config().validate().context("invalid reminder settings")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryConfig::for_provider();
        let provider = CircuitConfig::for_provider();
        let store = CircuitConfig::for_store();

        Self {
            database_url: "postgresql://localhost/herald".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_acquire_timeout_secs: 10,
            workers_per_channel: herald_delivery::DEFAULT_WORKERS_PER_CHANNEL,
            poll_interval_ms: herald_delivery::DEFAULT_POLL_INTERVAL_MS,
            shutdown_timeout_secs: herald_delivery::DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            retry_max_retries: retry.max_retries,
            retry_initial_delay_ms: millis(retry.initial_delay),
            retry_max_delay_ms: millis(retry.max_delay),
            retry_backoff_multiplier: retry.backoff_multiplier,
            retry_jitter: retry.jitter_enabled,
            retry_global_timeout_ms: retry.global_timeout.map_or(0, millis),
            provider_failure_threshold: provider.failure_threshold,
            provider_timeout_ms: millis(provider.timeout),
            provider_reset_timeout_ms: millis(provider.reset_timeout),
            store_failure_threshold: store.failure_threshold,
            store_timeout_ms: millis(store.timeout),
            store_reset_timeout_ms: millis(store.reset_timeout),
            reminder_sweep_interval_secs: 60,
            reminder_batch_size: 100,
            reminder_expiry_hours: 2,
            reminder_channels: vec![Channel::Email],
            email_provider_url: None,
            sms_provider_url: None,
            chat_provider_url: None,
            provider_api_key: None,
            recover_stale_sending_after_secs: None,
            requeue_owed_on_start: true,
            log_format: "text".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
