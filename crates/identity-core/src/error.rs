//! Domain error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A command assumed an existing aggregate, but none has been created.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// A create command targeted an aggregate that already exists.
    #[error("aggregate already exists: {0}")]
    AlreadyExists(Uuid),

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: \
         expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// An event with this identifier has already been stored.
    #[error("duplicate event: {0}")]
    DuplicateEvent(Uuid),

    /// The command type is not handled by any aggregate.
    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// The command pipeline did not finish before its deadline.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` when resubmitting the same request may succeed.
    ///
    /// Conflicts are resolved by reloading and re-executing, timeouts and
    /// infrastructure failures by retrying with backoff. Everything else is a
    /// terminal, user-facing rejection.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Timeout(_) | Self::Infrastructure(_)
        )
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AggregateNotFound(_) => "aggregate_not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::DuplicateEvent(_) => "duplicate_event",
            Self::UnknownCommand(_) => "unknown_command",
            Self::Validation(_) => "validation_error",
            Self::Timeout(_) => "timeout",
            Self::Infrastructure(_) => "infrastructure_error",
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure(format!("serialization failed: {err}"))
    }
}
