//! Error types for persistence and domain validation.
//!
//! Store failures are surfaced as `CoreError` so the delivery layer can log
//! them without caring which backend produced them.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested status change is not allowed from the current status.
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        /// Identifier of the record being updated.
        entity: String,
        /// Status the record currently holds.
        from: String,
        /// Status that was requested.
        to: String,
    },
}

impl CoreError {
    /// Returns true when the error was raised by the backing store rather
    /// than by domain validation.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
