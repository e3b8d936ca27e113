//! Repository for notification record operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{NotificationId, NotificationRecord, NotificationStatus, NotificationUpdate},
};

const COLUMNS: &str = "id, channel, recipient_id, status, attempts, last_error, sent_at, \
                       external_message_id, cost, provider_response, metadata, payload, \
                       created_at, updated_at";

/// Repository for notification records.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: NotificationId) -> Result<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Inserts a record unless one with the same id already exists.
    ///
    /// Returns `true` when a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, record: &NotificationRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, channel, recipient_id, status, attempts, last_error, sent_at,
                external_message_id, cost, provider_response, metadata, payload, created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.channel)
        .bind(&record.recipient_id)
        .bind(record.status)
        .bind(record.attempts)
        .bind(&record.last_error)
        .bind(record.sent_at)
        .bind(&record.external_message_id)
        .bind(record.cost)
        .bind(&record.provider_response)
        .bind(&record.metadata)
        .bind(&record.payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Applies a partial update guarded by the forward-only status rules.
    ///
    /// When `update.status` is set the row must currently hold one of the
    /// statuses allowed to move there; field-only updates never touch
    /// terminal rows. Returns `true` when the row changed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, id: NotificationId, update: &NotificationUpdate) -> Result<bool> {
        let allowed: Vec<String> = match update.status {
            Some(target) => target.allowed_sources().iter().map(|s| s.to_string()).collect(),
            None => NotificationStatus::ALL
                .iter()
                .filter(|s| !s.is_terminal())
                .map(|s| s.to_string())
                .collect(),
        };

        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = COALESCE($2, status),
                attempts = COALESCE($3, attempts),
                last_error = COALESCE($4, last_error),
                sent_at = COALESCE($5, sent_at),
                external_message_id = COALESCE($6, external_message_id),
                cost = COALESCE($7, cost),
                provider_response = COALESCE($8, provider_response),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($9)
            "#,
        )
        .bind(id)
        .bind(update.status)
        .bind(update.attempts)
        .bind(&update.last_error)
        .bind(update.sent_at)
        .bind(&update.external_message_id)
        .bind(update.cost)
        .bind(&update.provider_response)
        .bind(&allowed)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds records left in `sending` since before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_stale_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let records = sqlx::query_as::<_, NotificationRecord>(&format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE status = 'sending' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Finds records still waiting for a delivery run (`scheduled` or
    /// `pending`), oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_owed(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let records = sqlx::query_as::<_, NotificationRecord>(&format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE status IN ('scheduled', 'pending') \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }
}
