//! Command abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request metadata carried by every command and copied onto its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// The user issuing the command, if authenticated upstream.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Correlation ID to trace this command through the system.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// When the command was issued.
    pub timestamp: DateTime<Utc>,
}

/// Trait that all commands implement.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str;

    /// Unique identifier of this request; becomes the causation ID of the
    /// events it produces.
    fn command_id(&self) -> Uuid;

    /// Request metadata.
    fn metadata(&self) -> &CommandMetadata;
}
