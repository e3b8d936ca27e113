//! Core domain models and strongly-typed identifiers.
//!
//! Defines delivery jobs, notification records, scheduled reminders and the
//! forward-only status machines that govern them. Database serialization
//! traits live next to each type so repositories can bind them directly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed notification identifier.
///
/// A delivery job and the notification record tracking it share this id, so
/// a worker can look up the record for any job it dequeues.
///
/// # Example
///
/// ```
/// use herald_core::models::NotificationId;
/// let id = NotificationId::new();
/// println!("Delivering notification: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for NotificationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed reminder identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderId(pub Uuid);

impl ReminderId {
    /// Creates a new random reminder ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReminderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReminderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ReminderId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ReminderId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ReminderId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ReminderId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Outbound communication medium.
///
/// Each channel owns exactly one circuit breaker and one retry policy for the
/// lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Email through an SMTP relay or email API.
    Email,
    /// SMS through a gateway.
    Sms,
    /// Chat and media messaging.
    Chat,
}

impl Channel {
    /// Every supported channel, in a stable order.
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Chat];

    /// Returns the lowercase wire name of the channel.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "chat" | "whatsapp" => Ok(Self::Chat),
            other => Err(CoreError::InvalidInput(format!("unknown channel: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for Channel {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Channel {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(|_| format!("invalid channel: {s}").into())
    }
}

impl sqlx::Encode<'_, PgDb> for Channel {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Notification lifecycle status.
///
/// Status only ever moves forward:
///
/// ```text
/// Scheduled -> Pending -> Sending -> Sent
///                                 -> Failed
/// ```
///
/// Both `Sent` and `Failed` are terminal, so a late provider success can
/// never flip a failed record back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Waiting for a future send time.
    Scheduled,

    /// Owed to the recipient and waiting for a worker.
    Pending,

    /// A worker is attempting delivery.
    Sending,

    /// Accepted by the provider.
    Sent,

    /// Delivery definitively failed.
    Failed,
}

impl NotificationStatus {
    /// Every status in lifecycle order.
    pub const ALL: [NotificationStatus; 5] =
        [Self::Scheduled, Self::Pending, Self::Sending, Self::Sent, Self::Failed];

    const fn rank(self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Pending => 1,
            Self::Sending => 2,
            Self::Sent | Self::Failed => 3,
        }
    }

    /// Returns true for statuses no transition may leave.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Returns whether moving from `self` to `next` is a forward step.
    pub const fn can_transition_to(self, next: NotificationStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses from which a record may move into `self`.
    ///
    /// Used to build conditional updates keyed on the expected prior status.
    pub fn allowed_sources(self) -> Vec<NotificationStatus> {
        Self::ALL.into_iter().filter(|from| from.can_transition_to(self)).collect()
    }

    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid notification status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for NotificationStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(|_| format!("invalid notification status: {s}").into())
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Scheduled reminder lifecycle status.
///
/// ```text
/// Scheduled -> Processing -> Sent
///     |             |     -> Failed
///     |             |     -> Expired
///     |             `-> Scheduled (re-armed with next_retry_at)
///     `-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    /// Waiting for its scheduled date.
    Scheduled,
    /// Claimed by a sweep; jobs are being enqueued.
    Processing,
    /// Jobs for every channel were enqueued.
    Sent,
    /// Firing failed after `max_attempts`.
    Failed,
    /// Cancelled before firing.
    Cancelled,
    /// Left in processing past the expiration window.
    Expired,
}

impl ReminderStatus {
    /// Returns true for statuses no transition may leave.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Returns whether moving from `self` to `next` is permitted.
    pub const fn can_transition_to(self, next: ReminderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Sent | Self::Failed | Self::Expired | Self::Scheduled)
        )
    }

    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(CoreError::InvalidInput(format!("invalid reminder status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for ReminderStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ReminderStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(|_| format!("invalid reminder status: {s}").into())
    }
}

impl sqlx::Encode<'_, PgDb> for ReminderStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// How long before the booked event a reminder fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderType {
    /// Seven days before.
    #[serde(rename = "7_day")]
    SevenDay,
    /// Twenty-four hours before.
    #[serde(rename = "24_hour")]
    TwentyFourHour,
    /// One hour before.
    #[serde(rename = "1_hour")]
    OneHour,
}

impl ReminderType {
    /// Offset between the reminder and the booked event.
    pub fn lead_time(self) -> Duration {
        match self {
            Self::SevenDay => Duration::days(7),
            Self::TwentyFourHour => Duration::hours(24),
            Self::OneHour => Duration::hours(1),
        }
    }

    /// Template rendered for this reminder type.
    pub fn template_ref(self) -> String {
        format!("reminder.{}", self.as_str())
    }

    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenDay => "7_day",
            Self::TwentyFourHour => "24_hour",
            Self::OneHour => "1_hour",
        }
    }
}

impl fmt::Display for ReminderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "7_day" => Ok(Self::SevenDay),
            "24_hour" => Ok(Self::TwentyFourHour),
            "1_hour" => Ok(Self::OneHour),
            other => Err(CoreError::InvalidInput(format!("invalid reminder type: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for ReminderType {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ReminderType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(|_| format!("invalid reminder type: {s}").into())
    }
}

impl sqlx::Encode<'_, PgDb> for ReminderType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Queue priority. Higher priorities are dequeued first; equal priorities
/// keep FIFO order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Bulk traffic.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Time-sensitive traffic such as reminders.
    High,
    /// Operational alerts.
    Urgent,
}

/// Destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable identifier of the recipient in the calling system.
    pub id: String,

    /// Channel-specific address: email address, phone number or chat handle.
    pub address: String,

    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Recipient {
    /// Creates a recipient without a display name.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self { id: id.into(), address: address.into(), display_name: None }
    }
}

/// Message body, either literal or rendered by the provider from a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Literal content.
    Inline {
        /// Subject line, ignored by channels without one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        /// Message body.
        body: String,
    },
    /// Provider-side template.
    Template {
        /// Template name.
        template_ref: String,
        /// Values substituted into the template.
        #[serde(default)]
        variables: serde_json::Value,
    },
}

impl MessageContent {
    /// Shorthand for inline content without a subject.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Inline { subject: None, body: body.into() }
    }
}

/// File attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Location the provider fetches the file from.
    pub url: String,
}

/// Auxiliary job data carried through to the adapter and the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Attached files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Carbon-copy addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Blind carbon-copy addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    /// What caused the message, for example `booking.confirmed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Reminder that spawned this job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_id: Option<ReminderId>,
    /// Free-form caller data.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// Transient unit of queue work: "send this message".
///
/// Jobs are never persisted themselves; the [`NotificationRecord`] sharing
/// the job's id is the durable trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Id of the job and of its notification record.
    pub notification_id: NotificationId,
    /// Channel to deliver on.
    pub channel: Channel,
    /// Destination.
    pub recipient: Recipient,
    /// Body or template.
    pub content: MessageContent,
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// Earliest time the job may be released to a worker.
    pub scheduled_at: DateTime<Utc>,
    /// Attachments, cc/bcc and trigger.
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl DeliveryJob {
    /// Creates a job due immediately with normal priority.
    pub fn new(channel: Channel, recipient: Recipient, content: MessageContent) -> Self {
        Self {
            notification_id: NotificationId::new(),
            channel,
            recipient,
            content,
            priority: Priority::Normal,
            scheduled_at: Utc::now(),
            metadata: JobMetadata::default(),
        }
    }

    /// Sets the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Defers the job until `at`.
    #[must_use]
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Replaces the job metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns true once the job may be handed to a worker.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Builds the record a submitter or worker persists for this job.
    ///
    /// Future-dated jobs start out `Scheduled`, everything else `Pending`.
    pub fn to_record(&self, now: DateTime<Utc>) -> NotificationRecord {
        let status =
            if self.is_due(now) { NotificationStatus::Pending } else { NotificationStatus::Scheduled };

        NotificationRecord {
            id: self.notification_id,
            channel: self.channel,
            recipient_id: self.recipient.id.clone(),
            status,
            attempts: 0,
            last_error: None,
            sent_at: None,
            external_message_id: None,
            cost: None,
            provider_response: None,
            metadata: serde_json::to_value(&self.metadata).unwrap_or(serde_json::Value::Null),
            payload: serde_json::to_value(self).ok(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable record tracking the outcome of one delivery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    /// Same id as the job.
    pub id: NotificationId,

    /// Channel the notification is sent on.
    pub channel: Channel,

    /// Recipient identifier from the job.
    pub recipient_id: String,

    /// Current lifecycle status.
    pub status: NotificationStatus,

    /// Provider attempts made by the last delivery run.
    pub attempts: i32,

    /// Most recent error, kept on failure for operators.
    pub last_error: Option<String>,

    /// When the provider accepted the message.
    pub sent_at: Option<DateTime<Utc>>,

    /// Provider message id.
    pub external_message_id: Option<String>,

    /// Provider-reported cost.
    pub cost: Option<f64>,

    /// Raw provider response.
    pub provider_response: Option<serde_json::Value>,

    /// Job metadata snapshot.
    pub metadata: serde_json::Value,

    /// The full job, so an owed record can be re-enqueued after a restart.
    pub payload: Option<serde_json::Value>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Returns true while the record still waits for a delivery run.
    pub fn is_owed(&self) -> bool {
        matches!(self.status, NotificationStatus::Scheduled | NotificationStatus::Pending)
    }

    /// Rebuilds the job this record was created for. `None` when the record
    /// carries no payload or it no longer decodes.
    pub fn to_job(&self) -> Option<DeliveryJob> {
        let payload = self.payload.clone()?;
        serde_json::from_value::<DeliveryJob>(payload)
            .ok()
            .filter(|job| job.notification_id == self.id)
    }

    /// Applies an update in memory, honouring forward-only status rules.
    ///
    /// Returns `false` and leaves the record untouched when the update asks
    /// for a status the record cannot move to. Field-only updates are refused
    /// once the record is terminal.
    pub fn apply(&mut self, update: &NotificationUpdate, now: DateTime<Utc>) -> bool {
        match update.status {
            Some(next) if !self.status.can_transition_to(next) => return false,
            None if self.status.is_terminal() => return false,
            _ => {},
        }

        if let Some(next) = update.status {
            self.status = next;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(error) = &update.last_error {
            self.last_error = Some(error.clone());
        }
        if let Some(sent_at) = update.sent_at {
            self.sent_at = Some(sent_at);
        }
        if let Some(message_id) = &update.external_message_id {
            self.external_message_id = Some(message_id.clone());
        }
        if let Some(cost) = update.cost {
            self.cost = Some(cost);
        }
        if let Some(response) = &update.provider_response {
            self.provider_response = Some(response.clone());
        }
        self.updated_at = now;
        true
    }
}

/// Partial update of a notification record.
///
/// `None` fields are left unchanged. When `status` is set the update only
/// lands if the record's current status may move there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationUpdate {
    /// Target status.
    pub status: Option<NotificationStatus>,
    /// Attempt count to record.
    pub attempts: Option<i32>,
    /// Error to record.
    pub last_error: Option<String>,
    /// Acceptance time.
    pub sent_at: Option<DateTime<Utc>>,
    /// Provider message id.
    pub external_message_id: Option<String>,
    /// Provider-reported cost.
    pub cost: Option<f64>,
    /// Raw provider response.
    pub provider_response: Option<serde_json::Value>,
}

impl NotificationUpdate {
    /// Status-only update.
    pub fn status(status: NotificationStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Finalizes a record as sent.
    pub fn sent(
        sent_at: DateTime<Utc>,
        attempts: u32,
        external_message_id: Option<String>,
        cost: Option<f64>,
        provider_response: Option<serde_json::Value>,
    ) -> Self {
        Self {
            status: Some(NotificationStatus::Sent),
            attempts: Some(i32::try_from(attempts).unwrap_or(i32::MAX)),
            sent_at: Some(sent_at),
            external_message_id,
            cost,
            provider_response,
            ..Self::default()
        }
    }

    /// Finalizes a record as failed.
    pub fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: Some(NotificationStatus::Failed),
            attempts: Some(i32::try_from(attempts).unwrap_or(i32::MAX)),
            last_error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A reminder that must fire once ahead of a booked event.
///
/// When due, one delivery job per configured channel is spawned. The
/// `attempts`/`max_attempts` pair counts firing attempts and is independent
/// of the per-send retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledReminder {
    /// Unique identifier.
    pub id: ReminderId,

    /// Reference of the booking the reminder belongs to.
    pub booking_ref: String,

    /// Recipient identifier.
    pub recipient_id: String,

    /// Recipient address used for every spawned job.
    pub recipient_address: String,

    /// Lead time class.
    pub reminder_type: ReminderType,

    /// When the reminder becomes due.
    pub scheduled_date: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: ReminderStatus,

    /// Firing attempts so far.
    pub attempts: i32,

    /// Firing attempts allowed before the reminder fails.
    pub max_attempts: i32,

    /// Most recent firing error.
    pub last_error: Option<String>,

    /// Earliest time a re-armed reminder may fire again.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the current processing run started.
    pub processing_started_at: Option<DateTime<Utc>>,

    /// When the reminder was created.
    pub created_at: DateTime<Utc>,

    /// When the reminder was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledReminder {
    /// Default number of firing attempts.
    pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

    /// Creates a reminder firing `reminder_type.lead_time()` before
    /// `event_at`.
    pub fn new(
        booking_ref: impl Into<String>,
        recipient: &Recipient,
        reminder_type: ReminderType,
        event_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReminderId::new(),
            booking_ref: booking_ref.into(),
            recipient_id: recipient.id.clone(),
            recipient_address: recipient.address.clone(),
            reminder_type,
            scheduled_date: event_at - reminder_type.lead_time(),
            status: ReminderStatus::Scheduled,
            attempts: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            next_retry_at: None,
            processing_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true when a sweep at `now` should fire this reminder.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == ReminderStatus::Scheduled
            && self.scheduled_date <= now
            && self.next_retry_at.map_or(true, |retry_at| retry_at <= now)
    }

    /// Returns true once no firing attempts remain.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Recipient the spawned jobs are addressed to.
    pub fn recipient(&self) -> Recipient {
        Recipient::new(self.recipient_id.clone(), self.recipient_address.clone())
    }
}
