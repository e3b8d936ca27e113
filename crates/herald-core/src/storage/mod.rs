//! PostgreSQL repositories for notification and reminder persistence.
//!
//! All status changes are conditional updates keyed on the expected prior
//! status, so concurrent workers and late provider responses can never move
//! a row backwards. Callers learn whether an update landed from the returned
//! flag instead of from an error.

use std::sync::Arc;

use sqlx::PgPool;

pub mod notifications;
pub mod reminders;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        channel TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        sent_at TIMESTAMPTZ,
        external_message_id TEXT,
        cost DOUBLE PRECISION,
        provider_response JSONB,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        payload JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS notifications_status_updated_idx
        ON notifications (status, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_reminders (
        id UUID PRIMARY KEY,
        booking_ref TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        recipient_address TEXT NOT NULL,
        reminder_type TEXT NOT NULL,
        scheduled_date TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        next_retry_at TIMESTAMPTZ,
        processing_started_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (booking_ref, reminder_type)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS scheduled_reminders_due_idx
        ON scheduled_reminders (status, scheduled_date)
    "#,
];

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Notification record operations.
    pub notifications: Arc<notifications::Repository>,

    /// Scheduled reminder operations.
    pub reminders: Arc<reminders::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            notifications: Arc::new(notifications::Repository::new(pool.clone())),
            reminders: Arc::new(reminders::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Creates tables and indexes when they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        tracing::debug!(statements = SCHEMA.len(), "database schema ensured");
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
