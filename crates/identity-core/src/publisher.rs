//! Hand-off point for committed events.

use async_trait::async_trait;
use tracing::info;

use crate::error::DomainError;
use crate::store::StoredEvent;

/// Receives each event after it has been durably appended.
///
/// Delivery is at-least-once: consumers must be idempotent on `event_id`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one committed event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the event could not be handed
    /// off.
    async fn publish(&self, event: &StoredEvent) -> Result<(), DomainError>;
}

/// Publisher that records committed events in the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: &StoredEvent) -> Result<(), DomainError> {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            version = event.sequence_number,
            "event published"
        );
        Ok(())
    }
}
