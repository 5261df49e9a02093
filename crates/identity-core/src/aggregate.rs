//! Aggregate root abstraction.

use tracing::debug;
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::DomainEvent;
use crate::store::{EventStore, StoredEvent};

/// Trait for aggregate roots that reconstitute from event history.
pub trait AggregateRoot: Send + Sync {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Aggregate type name recorded alongside every event and snapshot.
    const AGGREGATE_TYPE: &'static str;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the current version (highest event version applied).
    fn version(&self) -> i64;

    /// Apply an event to mutate internal state.
    ///
    /// Must be deterministic and free of side effects.
    fn apply(&mut self, event: &Self::Event);

    /// Returns the version the next produced event must carry.
    fn next_sequence_number(&self) -> i64 {
        self.version() + 1
    }

    /// Applies a freshly produced event and hands it to the caller's
    /// accumulator, so later behaviors in the same command see its effect.
    fn record(&mut self, event: Self::Event, pending: &mut UncommittedEvents<Self::Event>)
    where
        Self: Sized,
    {
        self.apply(&event);
        pending.push(event);
    }
}

/// Events produced by one command, waiting to be persisted as one batch.
///
/// The accumulator remembers the aggregate version it was opened at; that
/// version becomes the expected version of the conditional append.
#[derive(Debug)]
pub struct UncommittedEvents<E> {
    aggregate_id: Uuid,
    expected_version: i64,
    events: Vec<E>,
}

impl<E: DomainEvent> UncommittedEvents<E> {
    /// Opens an accumulator for the aggregate at its current version.
    #[must_use]
    pub fn for_aggregate<A>(aggregate: &A) -> Self
    where
        A: AggregateRoot<Event = E>,
    {
        Self {
            aggregate_id: aggregate.aggregate_id(),
            expected_version: aggregate.version(),
            events: Vec::new(),
        }
    }

    /// Adds an event to the batch.
    pub fn push(&mut self, event: E) {
        self.events.push(event);
    }

    /// Returns the pending events in production order.
    #[must_use]
    pub fn events(&self) -> &[E] {
        &self.events
    }

    /// Returns the number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` when no event has been produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The aggregate version observed when the accumulator was opened.
    #[must_use]
    pub fn expected_version(&self) -> i64 {
        self.expected_version
    }

    /// Converts the pending events into their storage representation.
    #[must_use]
    pub fn to_stored(&self) -> Vec<StoredEvent> {
        self.events.iter().map(DomainEvent::to_stored).collect()
    }

    /// Persists the batch atomically and returns what was written.
    ///
    /// # Errors
    ///
    /// Propagates the store's error; nothing is written on failure.
    pub async fn commit(self, store: &dyn EventStore) -> Result<Vec<StoredEvent>, DomainError> {
        if self.events.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.to_stored();
        store
            .save_events(self.aggregate_id, self.expected_version, &stored)
            .await?;
        debug!(
            aggregate_id = %self.aggregate_id,
            expected_version = self.expected_version,
            count = stored.len(),
            "committed events"
        );
        Ok(stored)
    }
}
