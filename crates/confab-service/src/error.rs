//! Service errors.

use thiserror::Error;

use crate::assistant::AssistantError;
use confab_store::StoreError;

/// Errors surfaced by the chat orchestrator.
///
/// The store's taxonomy passes through unchanged; the orchestrator adds the
/// authorization and assistant-availability failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Authorization failure: non-participant access or a non-sender edit.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The generation collaborator failed or timed out.
    #[error("Assistant unavailable: {0}")]
    AssistantUnavailable(#[from] AssistantError),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Shorthand for an authorization failure.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServiceError::Forbidden(msg.into())
    }
}
