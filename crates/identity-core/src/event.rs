//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::id::IdGenerator;
use crate::store::StoredEvent;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier (idempotency key for consumers).
    pub event_id: Uuid,
    /// Type name for deserialization routing.
    pub event_type: String,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: Uuid,
    /// Kind of aggregate owning the stream.
    pub aggregate_type: String,
    /// Gap-free version within the aggregate stream, starting at 1.
    pub sequence_number: i64,
    /// The user on whose behalf the event was recorded, if known.
    pub user_id: Option<Uuid>,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking this event to the command that caused it.
    pub causation_id: Option<Uuid>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    fn to_payload(&self) -> serde_json::Value;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Converts the event into its storage representation.
    fn to_stored(&self) -> StoredEvent {
        let meta = self.metadata();
        StoredEvent {
            event_id: meta.event_id,
            aggregate_id: meta.aggregate_id,
            aggregate_type: meta.aggregate_type.clone(),
            event_type: self.event_type().to_owned(),
            payload: self.to_payload(),
            sequence_number: meta.sequence_number,
            user_id: meta.user_id,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            occurred_at: meta.occurred_at,
        }
    }
}

impl From<&StoredEvent> for EventMetadata {
    fn from(stored: &StoredEvent) -> Self {
        Self {
            event_id: stored.event_id,
            event_type: stored.event_type.clone(),
            aggregate_id: stored.aggregate_id,
            aggregate_type: stored.aggregate_type.clone(),
            sequence_number: stored.sequence_number,
            user_id: stored.user_id,
            correlation_id: stored.correlation_id,
            causation_id: stored.causation_id,
            occurred_at: stored.occurred_at,
        }
    }
}

/// Everything a behavior needs to stamp the events it produces.
///
/// Time and identifiers come from injected sources so that replaying a
/// command in a test yields byte-identical events.
#[derive(Clone, Copy)]
pub struct EventContext<'a> {
    clock: &'a dyn Clock,
    ids: &'a dyn IdGenerator,
    user_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
}

impl<'a> EventContext<'a> {
    /// Creates a context with no request metadata.
    #[must_use]
    pub fn new(clock: &'a dyn Clock, ids: &'a dyn IdGenerator) -> Self {
        Self {
            clock,
            ids,
            user_id: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Sets the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: Option<Uuid>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Builds metadata for a new event at `sequence_number`.
    #[must_use]
    pub fn metadata(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        sequence_number: i64,
    ) -> EventMetadata {
        EventMetadata {
            event_id: self.ids.next_id(),
            event_type: event_type.to_owned(),
            aggregate_id,
            aggregate_type: aggregate_type.to_owned(),
            sequence_number,
            user_id: self.user_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            occurred_at: self.clock.now(),
        }
    }
}

impl std::fmt::Debug for EventContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("user_id", &self.user_id)
            .field("correlation_id", &self.correlation_id)
            .field("causation_id", &self.causation_id)
            .finish_non_exhaustive()
    }
}
