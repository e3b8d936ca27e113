//! Error types for notification delivery.
//!
//! Provider failures are classified once, at the adapter boundary, into a
//! [`DeliveryError`] whose [`ErrorKind`] drives both the retry predicate and
//! the circuit breaker's failure predicate. Nothing downstream inspects
//! error messages.

use std::{fmt, time::Duration};

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery error with an explicit classification.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("connection failed: {message}")]
    Connection {
        /// Underlying failure.
        message: String,
    },

    /// Operation did not finish within its per-attempt timeout.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded.
        timeout_ms: u64,
    },

    /// Provider is throttling us.
    #[error("rate limited by provider")]
    RateLimited {
        /// Provider's `Retry-After` hint.
        retry_after_ms: Option<u64>,
    },

    /// Provider reported a server-side failure.
    #[error("provider error{}: {message}", .status_code.map(|c| format!(" (HTTP {c})")).unwrap_or_default())]
    Provider {
        /// HTTP status, if the provider answered over HTTP.
        status_code: Option<u16>,
        /// Provider message.
        message: String,
    },

    /// Credentials were rejected.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Provider message.
        message: String,
    },

    /// The message itself was rejected.
    #[error("invalid message: {message}")]
    Validation {
        /// Provider message.
        message: String,
    },

    /// Circuit breaker rejected the call without invoking the operation.
    #[error("circuit open for {resource}, retry in {retry_after_ms}ms")]
    CircuitOpen {
        /// Resource whose breaker is open, usually a channel name.
        resource: String,
        /// Time left until the breaker admits a trial call.
        retry_after_ms: u64,
    },

    /// The whole retry sequence exceeded its ceiling.
    #[error("delivery gave up after {timeout_ms}ms and {attempts} attempts")]
    GlobalTimeout {
        /// Ceiling that was exceeded.
        timeout_ms: u64,
        /// Attempts started before the ceiling hit.
        attempts: u32,
    },

    /// Delivery store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Store failure.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// Shutdown was requested.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker that panicked.
        worker_id: usize,
        /// Join error.
        error: String,
    },

    /// Worker tasks did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout_secs}s")]
    ShutdownTimeout {
        /// Shutdown budget in seconds.
        timeout_secs: u64,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// What happened.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: duration_ms(timeout) }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after_ms: retry_after.map(duration_ms) }
    }

    /// Creates a provider error.
    pub fn provider(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider { status_code, message: message.into() }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a circuit open rejection.
    pub fn circuit_open(resource: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen { resource: resource.into(), retry_after_ms: duration_ms(retry_after) }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classifies an HTTP provider response.
    pub fn from_provider_status(
        status_code: u16,
        body: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let body = body.into();
        match status_code {
            401 | 403 => Self::authentication(format!("HTTP {status_code}: {body}")),
            400 | 404 | 413 | 415 | 422 => Self::validation(format!("HTTP {status_code}: {body}")),
            429 => Self::rate_limited(retry_after),
            _ => Self::provider(Some(status_code), body),
        }
    }

    /// Returns the classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::GlobalTimeout { .. } => ErrorKind::GlobalTimeout,
            Self::Store { .. } => ErrorKind::Store,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::ShutdownRequested | Self::ShutdownTimeout { .. } => ErrorKind::Shutdown,
            Self::WorkerPanic { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true when another attempt may succeed.
    pub const fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Returns true when this error indicates the protected resource is
    /// unhealthy and should count toward opening its circuit.
    pub const fn counts_toward_circuit(&self) -> bool {
        self.kind().counts_toward_circuit()
    }

    /// Minimum wait suggested by the error before retrying.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms: Some(ms) } => Some(Duration::from_millis(*ms)),
            Self::CircuitOpen { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::store(err.to_string())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Classification shared by the retry and circuit predicates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network connectivity.
    Connection,
    /// Per-attempt timeout.
    Timeout,
    /// Provider throttling.
    RateLimit,
    /// Provider-side failure.
    Provider,
    /// Rejected credentials.
    Authentication,
    /// Rejected payload.
    Validation,
    /// Breaker rejection.
    CircuitOpen,
    /// Retry ceiling exceeded.
    GlobalTimeout,
    /// Delivery store failure.
    Store,
    /// Bad configuration.
    Configuration,
    /// Shutdown in progress.
    Shutdown,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Retriable kinds: transient provider trouble and breaker rejections.
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Timeout
                | Self::RateLimit
                | Self::Provider
                | Self::CircuitOpen
                | Self::Store
        )
    }

    /// Kinds that mean the protected resource is unhealthy.
    ///
    /// Authentication and validation errors are caller problems and never
    /// open a circuit.
    pub const fn counts_toward_circuit(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::RateLimit | Self::Provider | Self::Store
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Provider => "provider",
            Self::Authentication => "auth",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::GlobalTimeout => "global_timeout",
            Self::Store => "store",
            Self::Configuration => "configuration",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
