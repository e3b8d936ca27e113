//! Core domain models and event types.
//!
//! Provides strongly-typed identifiers, the notification and reminder status
//! machines, delivery lifecycle events, the clock abstraction, and the
//! PostgreSQL repositories shared by the delivery engine and the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, MulticastEventHandler, NoOpEventHandler, NotificationEvent,
    NotificationFailedEvent, NotificationSentEvent, RecordingEventHandler,
};
pub use models::{
    Channel, DeliveryJob, MessageContent, NotificationId, NotificationRecord, NotificationStatus,
    NotificationUpdate, Priority, Recipient, ReminderId, ReminderStatus, ReminderType,
    ScheduledReminder,
};
pub use time::{Clock, RealClock, TestClock};
