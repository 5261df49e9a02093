//! Generic state reconstruction from an aggregate's event history.
//!
//! Intended for projections and read models that work on raw stored events
//! and keep their own state type. Aggregates do not go through this module:
//! they fold typed events through [`AggregateRoot::apply`], which also
//! enforces version ordering.
//!
//! [`AggregateRoot::apply`]: crate::aggregate::AggregateRoot::apply

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use crate::error::DomainError;
use crate::store::{EventStore, StoredEvent};

/// A state transition for one event type.
pub type EventHandler<S> = Box<dyn Fn(S, &StoredEvent) -> S + Send + Sync>;

/// Table of state transitions keyed by event type.
pub struct EventHandlers<S> {
    handlers: HashMap<String, EventHandler<S>>,
}

impl<S> EventHandlers<S> {
    /// Creates an empty handler table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the transition for `event_type`, replacing any earlier one.
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(S, &StoredEvent) -> S + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Box::new(handler));
        self
    }

    /// Returns `true` if a transition is registered for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

impl<S> Default for EventHandlers<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for EventHandlers<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("EventHandlers")
            .field("event_types", &types)
            .finish()
    }
}

/// Folds `events` in order over `initial`.
///
/// Events without a registered transition leave the state untouched and are
/// reported with a warning.
pub fn fold_events<S>(events: &[StoredEvent], handlers: &EventHandlers<S>, initial: S) -> S {
    events.iter().fold(initial, |state, event| {
        match handlers.handlers.get(&event.event_type) {
            Some(handler) => handler(state, event),
            None => {
                warn!(
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    version = event.sequence_number,
                    "no handler for event type; state passed through"
                );
                state
            }
        }
    })
}

/// Replays every stored event of an aggregate through `handlers`.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the events cannot be loaded.
pub async fn rebuild_aggregate_state<S>(
    store: &dyn EventStore,
    aggregate_id: Uuid,
    handlers: &EventHandlers<S>,
    initial: S,
) -> Result<S, DomainError> {
    let events = store.get_events(aggregate_id, None).await?;
    Ok(fold_events(&events, handlers, initial))
}
