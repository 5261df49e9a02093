//! Identity driver error types.

use thiserror::Error;

/// Startup and runtime errors for the command driver.
#[derive(Debug, Error)]
pub enum AppError {
    /// An environment variable is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Reading commands or writing results failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The event store could not be prepared.
    #[error("store error: {0}")]
    Store(#[from] identity_core::error::DomainError),
}
