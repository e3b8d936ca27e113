//! Repository for scheduled reminder operations.
//!
//! Every transition is a single conditional `UPDATE`; the boolean result
//! tells the caller whether the reminder was in the expected status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{ReminderId, ScheduledReminder},
};

const COLUMNS: &str = "id, booking_ref, recipient_id, recipient_address, reminder_type, \
                       scheduled_date, status, attempts, max_attempts, last_error, next_retry_at, \
                       processing_started_at, created_at, updated_at";

/// Repository for scheduled reminders.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a reminder. A second reminder of the same type for the same
    /// booking is ignored; returns `true` when a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, reminder: &ScheduledReminder) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_reminders (
                id, booking_ref, recipient_id, recipient_address, reminder_type,
                scheduled_date, status, attempts, max_attempts, last_error, next_retry_at,
                processing_started_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(reminder.id)
        .bind(&reminder.booking_ref)
        .bind(&reminder.recipient_id)
        .bind(&reminder.recipient_address)
        .bind(reminder.reminder_type)
        .bind(reminder.scheduled_date)
        .bind(reminder.status)
        .bind(reminder.attempts)
        .bind(reminder.max_attempts)
        .bind(&reminder.last_error)
        .bind(reminder.next_retry_at)
        .bind(reminder.processing_started_at)
        .bind(reminder.created_at)
        .bind(reminder.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a reminder by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: ReminderId) -> Result<Option<ScheduledReminder>> {
        let reminder = sqlx::query_as::<_, ScheduledReminder>(&format!(
            "SELECT {COLUMNS} FROM scheduled_reminders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(reminder)
    }

    /// Returns up to `limit` scheduled reminders due at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_scheduled_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledReminder>> {
        let reminders = sqlx::query_as::<_, ScheduledReminder>(&format!(
            "SELECT {COLUMNS} FROM scheduled_reminders \
             WHERE status = 'scheduled' AND scheduled_date <= $1 \
               AND (next_retry_at IS NULL OR next_retry_at <= $1) \
             ORDER BY scheduled_date ASC LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(reminders)
    }

    /// Returns reminders that entered processing before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledReminder>> {
        let reminders = sqlx::query_as::<_, ScheduledReminder>(&format!(
            "SELECT {COLUMNS} FROM scheduled_reminders \
             WHERE status = 'processing' AND processing_started_at < $1 \
             ORDER BY processing_started_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await?;

        Ok(reminders)
    }

    /// `scheduled -> processing`, counting one firing attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_as_processing(&self, id: ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders
            SET status = 'processing', attempts = attempts + 1,
                processing_started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `processing -> sent`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_as_sent(&self, id: ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders
            SET status = 'sent', last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `processing -> scheduled` with `next_retry_at` when a retry time is
    /// given, otherwise `processing -> failed`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_as_failed(
        &self,
        id: ReminderId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status = if next_retry_at.is_some() { "scheduled" } else { "failed" };

        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders
            SET status = $2, last_error = $3, next_retry_at = $4,
                processing_started_at = NULL, updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `processing -> expired`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_as_expired(&self, id: ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders
            SET status = 'expired', last_error = 'processing window expired', updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `scheduled -> cancelled`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn cancel(&self, id: ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
