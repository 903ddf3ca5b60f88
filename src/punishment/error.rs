//! Error types for punishment operations

use crate::punishment::{PlayerId, PunishmentKind, PunishmentState, StoreError};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during punishment operations
#[derive(Debug, Error)]
pub enum PunishmentError {
    /// Malformed input; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The player already has an active punishment of this kind
    #[error("Player {target} already has an active {kind}")]
    Conflict {
        target: PlayerId,
        kind: PunishmentKind,
    },

    /// Punishment record not found
    #[error("Punishment not found: {0}")]
    NotFound(Uuid),

    /// The punishment already reached a terminal state
    #[error("Punishment {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: PunishmentState },

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[source] StoreError),
}

impl PunishmentError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_retryable())
    }

    /// Whether this is the idempotent "already terminal" outcome
    #[must_use]
    pub fn is_already_terminal(&self) -> bool {
        matches!(self, Self::AlreadyTerminal { .. })
    }
}

impl From<StoreError> for PunishmentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

/// Result type for punishment operations
pub type PunishmentResult<T> = Result<T, PunishmentError>;
