//! Store errors.

use thiserror::Error;

/// Errors surfaced by the conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or empty input, rejected before persistence.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness race lost and the winning row could not be fetched.
    /// Absorbed internally by the get-or-create retry; callers should not
    /// normally observe it.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Underlying database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row failed to decode into its entity shape.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    /// Shorthand for a missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }
}
