//! Storage abstraction layer for the delivery engine.
//!
//! Workers and the reminder sweep only see these traits. Production wraps
//! `herald_core::storage::Storage`; tests use the in-memory doubles in
//! [`mock`], which can be told to fail on demand.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    error::{CoreError, Result},
    models::{NotificationId, NotificationRecord, NotificationUpdate, ReminderId, ScheduledReminder},
    storage::Storage,
    time::Clock,
};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig},
    error::DeliveryError,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Notification record operations used by workers.
///
/// Every call may fail independently. Callers treat failures as
/// bookkeeping problems, never as delivery failures.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Finds a record by id.
    fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<NotificationRecord>>;

    /// Inserts a record. Returns `false` if one with the same id exists.
    fn create(&self, record: NotificationRecord) -> StoreFuture<'_, bool>;

    /// Applies a partial update conditioned on the current status allowing
    /// it. Returns `false` when the record is missing or the status check
    /// refused the update.
    fn update(&self, id: NotificationId, update: NotificationUpdate) -> StoreFuture<'_, bool>;

    /// Records left in `sending` since before `older_than`.
    fn find_stale_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<NotificationRecord>>;

    /// Records still waiting for a delivery run, oldest first.
    fn find_owed(&self, limit: usize) -> StoreFuture<'_, Vec<NotificationRecord>>;
}

/// Scheduled reminder operations used by the reminder sweep.
///
/// Each `mark_as_*` is conditioned on the expected prior status and
/// returns whether it applied.
pub trait ReminderStore: Send + Sync + 'static {
    /// Inserts a reminder. Returns `false` for a duplicate booking and type.
    fn create(&self, reminder: ScheduledReminder) -> StoreFuture<'_, bool>;

    /// Finds a reminder by id.
    fn find_by_id(&self, id: ReminderId) -> StoreFuture<'_, Option<ScheduledReminder>>;

    /// Scheduled reminders due at `now`, oldest first.
    fn find_scheduled_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ScheduledReminder>>;

    /// Reminders that entered processing before `cutoff`.
    fn find_expired(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<ScheduledReminder>>;

    /// `scheduled -> processing`, counting one firing attempt.
    fn mark_as_processing(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// `processing -> sent`.
    fn mark_as_sent(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// `processing -> scheduled` when `next_retry_at` is set, otherwise
    /// `processing -> failed`.
    fn mark_as_failed(
        &self,
        id: ReminderId,
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// `processing -> expired`.
    fn mark_as_expired(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// `scheduled -> cancelled`.
    fn cancel(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool>;
}

/// PostgreSQL notification store.
pub struct PostgresDeliveryStore {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStore for PostgresDeliveryStore {
    fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<NotificationRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_id(id).await })
    }

    fn create(&self, record: NotificationRecord) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.create(&record).await })
    }

    fn update(&self, id: NotificationId, update: NotificationUpdate) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.update(id, &update).await })
    }

    fn find_stale_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<NotificationRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_stale_sending(older_than, limit).await })
    }

    fn find_owed(&self, limit: usize) -> StoreFuture<'_, Vec<NotificationRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_owed(limit).await })
    }
}

/// PostgreSQL reminder store.
pub struct PostgresReminderStore {
    storage: Arc<Storage>,
}

impl PostgresReminderStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl ReminderStore for PostgresReminderStore {
    fn create(&self, reminder: ScheduledReminder) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.create(&reminder).await })
    }

    fn find_by_id(&self, id: ReminderId) -> StoreFuture<'_, Option<ScheduledReminder>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.find_by_id(id).await })
    }

    fn find_scheduled_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ScheduledReminder>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.find_scheduled_ready(now, limit).await })
    }

    fn find_expired(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<ScheduledReminder>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.find_expired(cutoff).await })
    }

    fn mark_as_processing(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.mark_as_processing(id, now).await })
    }

    fn mark_as_sent(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.mark_as_sent(id, now).await })
    }

    fn mark_as_failed(
        &self,
        id: ReminderId,
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.mark_as_failed(id, &error, next_retry_at, now).await })
    }

    fn mark_as_expired(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.mark_as_expired(id, now).await })
    }

    fn cancel(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.reminders.cancel(id, now).await })
    }
}

/// Delivery store behind a circuit breaker.
///
/// Once the store keeps failing, calls fail fast with the breaker's
/// rejection instead of piling up on a dead connection. Callers see the
/// same `CoreError::Database` either way.
pub struct GuardedDeliveryStore {
    inner: Arc<dyn DeliveryStore>,
    breaker: CircuitBreaker,
}

impl GuardedDeliveryStore {
    /// Wraps `inner` with a breaker named `delivery-store`.
    pub fn new(inner: Arc<dyn DeliveryStore>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { inner, breaker: CircuitBreaker::new("delivery-store", config, clock) }
    }

    /// The breaker guarding the store.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .call(|| async move { operation.await.map_err(DeliveryError::from) })
            .await
            .into_result()
            .map_err(|error| match error {
                DeliveryError::Store { message } => CoreError::Database(message),
                other => CoreError::Database(other.to_string()),
            })
    }
}

impl DeliveryStore for GuardedDeliveryStore {
    fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<NotificationRecord>> {
        Box::pin(self.guarded(self.inner.find_by_id(id)))
    }

    fn create(&self, record: NotificationRecord) -> StoreFuture<'_, bool> {
        Box::pin(self.guarded(self.inner.create(record)))
    }

    fn update(&self, id: NotificationId, update: NotificationUpdate) -> StoreFuture<'_, bool> {
        Box::pin(self.guarded(self.inner.update(id, update)))
    }

    fn find_stale_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<NotificationRecord>> {
        Box::pin(self.guarded(self.inner.find_stale_sending(older_than, limit)))
    }

    fn find_owed(&self, limit: usize) -> StoreFuture<'_, Vec<NotificationRecord>> {
        Box::pin(self.guarded(self.inner.find_owed(limit)))
    }
}

pub mod mock {
    //! In-memory stores for testing.
    //!
    //! Both doubles enforce the same conditional-status rules as the
    //! PostgreSQL repositories, and both can be told to fail.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use herald_core::{
        error::{CoreError, Result},
        models::{
            NotificationId, NotificationRecord, NotificationStatus, NotificationUpdate,
            ReminderId, ReminderStatus, ScheduledReminder,
        },
        time::{Clock, RealClock},
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStore, ReminderStore, StoreFuture};

    #[derive(Default)]
    struct Failures {
        find: Option<String>,
        create: Option<String>,
        update: Option<String>,
    }

    /// In-memory notification store.
    pub struct MockDeliveryStore {
        records: Arc<RwLock<HashMap<NotificationId, NotificationRecord>>>,
        failures: Arc<RwLock<Failures>>,
        update_calls: Arc<AtomicU32>,
        clock: Arc<dyn Clock>,
    }

    impl Default for MockDeliveryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockDeliveryStore {
        /// Creates an empty store stamping updates with the wall clock.
        pub fn new() -> Self {
            Self {
                records: Arc::default(),
                failures: Arc::default(),
                update_calls: Arc::default(),
                clock: Arc::new(RealClock::new()),
            }
        }

        /// Stamps `updated_at` from `clock` instead of the wall clock.
        #[must_use]
        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        /// Seeds a record.
        pub async fn insert(&self, record: NotificationRecord) {
            self.records.write().await.insert(record.id, record);
        }

        /// Current copy of a record.
        pub async fn record(&self, id: NotificationId) -> Option<NotificationRecord> {
            self.records.read().await.get(&id).cloned()
        }

        /// Current status of a record.
        pub async fn status(&self, id: NotificationId) -> Option<NotificationStatus> {
            self.records.read().await.get(&id).map(|record| record.status)
        }

        /// Number of records currently in `status`.
        pub async fn count_with_status(&self, status: NotificationStatus) -> usize {
            self.records.read().await.values().filter(|record| record.status == status).count()
        }

        /// Number of stored records.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Returns true when no records are stored.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }

        /// Fails every `find_by_id` until cleared.
        pub async fn fail_finds(&self, error: impl Into<String>) {
            self.failures.write().await.find = Some(error.into());
        }

        /// Fails every `create` until cleared.
        pub async fn fail_creates(&self, error: impl Into<String>) {
            self.failures.write().await.create = Some(error.into());
        }

        /// Fails every `update` until cleared.
        pub async fn fail_updates(&self, error: impl Into<String>) {
            self.failures.write().await.update = Some(error.into());
        }

        /// Fails every operation until cleared.
        pub async fn fail_everything(&self, error: impl Into<String>) {
            let error = error.into();
            let mut failures = self.failures.write().await;
            failures.find = Some(error.clone());
            failures.create = Some(error.clone());
            failures.update = Some(error);
        }

        /// Clears injected failures.
        pub async fn clear_failures(&self) {
            *self.failures.write().await = Failures::default();
        }

        /// `update` calls received, including failed ones.
        pub fn update_calls(&self) -> u32 {
            self.update_calls.load(Ordering::SeqCst)
        }
    }

    impl DeliveryStore for MockDeliveryStore {
        fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<NotificationRecord>> {
            Box::pin(async move {
                if let Some(error) = self.failures.read().await.find.clone() {
                    return Err(CoreError::Database(error));
                }
                Ok(self.records.read().await.get(&id).cloned())
            })
        }

        fn create(&self, record: NotificationRecord) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                if let Some(error) = self.failures.read().await.create.clone() {
                    return Err(CoreError::Database(error));
                }
                let mut records = self.records.write().await;
                if records.contains_key(&record.id) {
                    return Ok(false);
                }
                records.insert(record.id, record);
                Ok(true)
            })
        }

        fn update(&self, id: NotificationId, update: NotificationUpdate) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.update_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(error) = self.failures.read().await.update.clone() {
                    return Err(CoreError::Database(error));
                }
                let now = self.clock.now_utc();
                let mut records = self.records.write().await;
                Ok(records.get_mut(&id).is_some_and(|record| record.apply(&update, now)))
            })
        }

        fn find_stale_sending(
            &self,
            older_than: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<NotificationRecord>> {
            Box::pin(async move {
                if let Some(error) = self.failures.read().await.find.clone() {
                    return Err(CoreError::Database(error));
                }
                let mut stale: Vec<NotificationRecord> = self
                    .records
                    .read()
                    .await
                    .values()
                    .filter(|r| r.status == NotificationStatus::Sending && r.updated_at < older_than)
                    .cloned()
                    .collect();
                stale.sort_by_key(|r| r.updated_at);
                stale.truncate(limit);
                Ok(stale)
            })
        }

        fn find_owed(&self, limit: usize) -> StoreFuture<'_, Vec<NotificationRecord>> {
            Box::pin(async move {
                if let Some(error) = self.failures.read().await.find.clone() {
                    return Err(CoreError::Database(error));
                }
                let mut owed: Vec<NotificationRecord> = self
                    .records
                    .read()
                    .await
                    .values()
                    .filter(|record| record.is_owed())
                    .cloned()
                    .collect();
                owed.sort_by_key(|record| record.created_at);
                owed.truncate(limit);
                Ok(owed)
            })
        }
    }

    /// In-memory reminder store.
    #[derive(Default)]
    pub struct MockReminderStore {
        reminders: Arc<RwLock<HashMap<ReminderId, ScheduledReminder>>>,
        failure: Arc<RwLock<Option<String>>>,
    }

    impl MockReminderStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a reminder, bypassing the duplicate check.
        pub async fn insert(&self, reminder: ScheduledReminder) {
            self.reminders.write().await.insert(reminder.id, reminder);
        }

        /// Current copy of a reminder.
        pub async fn reminder(&self, id: ReminderId) -> Option<ScheduledReminder> {
            self.reminders.read().await.get(&id).cloned()
        }

        /// Fails every operation until cleared.
        pub async fn fail_everything(&self, error: impl Into<String>) {
            *self.failure.write().await = Some(error.into());
        }

        /// Clears the injected failure.
        pub async fn clear_failures(&self) {
            *self.failure.write().await = None;
        }

        async fn check(&self) -> Result<()> {
            match self.failure.read().await.clone() {
                Some(error) => Err(CoreError::Database(error)),
                None => Ok(()),
            }
        }

        async fn transition<F>(
            &self,
            id: ReminderId,
            from: ReminderStatus,
            apply: F,
        ) -> Result<bool>
        where
            F: FnOnce(&mut ScheduledReminder) + Send,
        {
            self.check().await?;
            let mut reminders = self.reminders.write().await;
            match reminders.get_mut(&id) {
                Some(reminder) if reminder.status == from => {
                    apply(reminder);
                    Ok(true)
                },
                _ => Ok(false),
            }
        }
    }

    impl ReminderStore for MockReminderStore {
        fn create(&self, reminder: ScheduledReminder) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.check().await?;
                let mut reminders = self.reminders.write().await;
                let duplicate = reminders.values().any(|existing| {
                    existing.id == reminder.id
                        || (existing.booking_ref == reminder.booking_ref
                            && existing.reminder_type == reminder.reminder_type)
                });
                if duplicate {
                    return Ok(false);
                }
                reminders.insert(reminder.id, reminder);
                Ok(true)
            })
        }

        fn find_by_id(&self, id: ReminderId) -> StoreFuture<'_, Option<ScheduledReminder>> {
            Box::pin(async move {
                self.check().await?;
                Ok(self.reminders.read().await.get(&id).cloned())
            })
        }

        fn find_scheduled_ready(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<ScheduledReminder>> {
            Box::pin(async move {
                self.check().await?;
                let mut ready: Vec<ScheduledReminder> = self
                    .reminders
                    .read()
                    .await
                    .values()
                    .filter(|reminder| reminder.is_ready(now))
                    .cloned()
                    .collect();
                ready.sort_by_key(|reminder| reminder.scheduled_date);
                ready.truncate(limit);
                Ok(ready)
            })
        }

        fn find_expired(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<ScheduledReminder>> {
            Box::pin(async move {
                self.check().await?;
                let mut expired: Vec<ScheduledReminder> = self
                    .reminders
                    .read()
                    .await
                    .values()
                    .filter(|reminder| {
                        reminder.status == ReminderStatus::Processing
                            && reminder.processing_started_at.is_some_and(|at| at < cutoff)
                    })
                    .cloned()
                    .collect();
                expired.sort_by_key(|reminder| reminder.processing_started_at);
                Ok(expired)
            })
        }

        fn mark_as_processing(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(self.transition(id, ReminderStatus::Scheduled, move |reminder| {
                reminder.status = ReminderStatus::Processing;
                reminder.attempts += 1;
                reminder.processing_started_at = Some(now);
                reminder.updated_at = now;
            }))
        }

        fn mark_as_sent(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(self.transition(id, ReminderStatus::Processing, move |reminder| {
                reminder.status = ReminderStatus::Sent;
                reminder.last_error = None;
                reminder.updated_at = now;
            }))
        }

        fn mark_as_failed(
            &self,
            id: ReminderId,
            error: String,
            next_retry_at: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            Box::pin(self.transition(id, ReminderStatus::Processing, move |reminder| {
                reminder.status = if next_retry_at.is_some() {
                    ReminderStatus::Scheduled
                } else {
                    ReminderStatus::Failed
                };
                reminder.last_error = Some(error);
                reminder.next_retry_at = next_retry_at;
                reminder.processing_started_at = None;
                reminder.updated_at = now;
            }))
        }

        fn mark_as_expired(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(self.transition(id, ReminderStatus::Processing, move |reminder| {
                reminder.status = ReminderStatus::Expired;
                reminder.last_error = Some("processing window expired".to_string());
                reminder.updated_at = now;
            }))
        }

        fn cancel(&self, id: ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(self.transition(id, ReminderStatus::Scheduled, move |reminder| {
                reminder.status = ReminderStatus::Cancelled;
                reminder.updated_at = now;
            }))
        }
    }
}
