//! Delivery resilience for Herald notifications.
//!
//! Every outbound message is a [`DeliveryJob`](herald_core::models::DeliveryJob)
//! taken from a per-channel queue by a channel worker, which drives the
//! matching notification record through its lifecycle:
//!
//! 1. **Reconcile** - create the record if missing, move it to `sending`
//! 2. **Deliver** - bounded retries around a per-channel circuit breaker
//!    around the channel adapter
//! 3. **Finalize** - conditional `sent`/`failed` write plus an event
//!
//! Store failures are logged and reported, never allowed to change what
//! gets delivered.
//!
//! # Key Features
//!
//! - **Circuit Breakers** - one per channel, plus one guarding the store
//! - **Exponential Backoff** - capped delays with ±25% jitter and an
//!   optional ceiling on the whole retry sequence
//! - **Typed Failures** - errors classified once at the adapter boundary
//! - **Scheduled Reminders** - due reminders fan out into delivery jobs
//! - **Graceful Shutdown** - in-flight jobs finish before workers exit
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{
//!     models::{Channel, DeliveryJob, MessageContent, Recipient},
//!     time::RealClock,
//! };
//! use herald_delivery::{
//!     adapter::mock::ScriptedAdapter,
//!     store::mock::{MockDeliveryStore, MockReminderStore},
//!     AppContext, ContextConfig, DeliveryError,
//! };
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let context = AppContext::new(
//!     ContextConfig::default(),
//!     Arc::new(MockDeliveryStore::new()),
//!     Arc::new(MockReminderStore::new()),
//!     Arc::new(RealClock::new()),
//! )
//! .with_adapter(Arc::new(ScriptedAdapter::new(Channel::Email)));
//!
//! let job = DeliveryJob::new(
//!     Channel::Email,
//!     Recipient::new("guest-1", "guest@example.com"),
//!     MessageContent::text("Your booking is confirmed"),
//! );
//! let report = context.send_now(job).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod circuit;
pub mod client;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod reminder;
pub mod retry;
pub mod store;
pub mod worker;
pub mod worker_pool;

pub use adapter::{ChannelAdapter, OutboundMessage, SendReceipt};
pub use circuit::{BreakerHealth, CircuitBreaker, CircuitConfig, CircuitState};
pub use context::{AppContext, ContextConfig};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{DeliveryError, ErrorKind, Result};
pub use reminder::{ReminderConfig, ReminderProcessor, SweepReport};
pub use retry::{RetryConfig, RetryManager, RetryOutcome};
pub use worker::{DeliveryOutcome, DeliveryReport};

/// Default number of workers per channel.
pub const DEFAULT_WORKERS_PER_CHANNEL: usize = 2;

/// Default idle wait between empty dequeues, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default time allowed for workers to stop, in seconds. Covers the
/// provider retry ceiling of two minutes plus the final record write.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 150;
