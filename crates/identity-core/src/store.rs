//! Event store abstraction.
//!
//! The store is the append-only source of truth for every aggregate. Appends
//! are conditional on the version the caller last observed, and global scans
//! use keyset pagination over `(occurred_at, event_id)` so they stay stable
//! while other writers append.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Page size used by [`EventStore::get_all_events`] when draining the log.
pub const ALL_EVENTS_PAGE_SIZE: usize = 500;

/// Default page size for [`EventStore::get_event_stream`].
pub const DEFAULT_STREAM_LIMIT: usize = 100;

/// Upper bound on a single [`EventStore::get_event_stream`] page.
pub const MAX_STREAM_LIMIT: usize = 1000;

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Kind of aggregate owning the stream.
    pub aggregate_type: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Sequence number within the aggregate stream.
    pub sequence_number: i64,
    /// Acting user, if known.
    pub user_id: Option<Uuid>,
    /// Correlation ID for tracing.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking to the causing command.
    pub causation_id: Option<Uuid>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// Materialized aggregate state at a known version.
///
/// Snapshots are derived data: `state` must reflect exactly the events up to
/// and including `version`, and anything later is replayed on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: Uuid,
    /// Kind of aggregate.
    pub aggregate_type: String,
    /// Version of the last event folded into `state`.
    pub version: i64,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Position of an event in the global, time-ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamPosition {
    /// Event timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Tie-breaker for events sharing a timestamp.
    pub event_id: Uuid,
}

impl StreamPosition {
    /// Returns the stream position of a stored event.
    #[must_use]
    pub fn of(event: &StoredEvent) -> Self {
        Self {
            occurred_at: event.occurred_at,
            event_id: event.event_id,
        }
    }
}

/// Filter for cross-aggregate scans.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only include these event types; `None` includes every type.
    pub event_types: Option<Vec<String>>,
    /// Only include events at or after this instant.
    pub from_timestamp: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Restricts the filter to the given event types.
    #[must_use]
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the filter to events at or after `from`.
    #[must_use]
    pub fn with_from_timestamp(mut self, from: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(from);
        self
    }

    /// Returns `true` when the event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let type_ok = self
            .event_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| *t == event.event_type));
        let time_ok = self
            .from_timestamp
            .is_none_or(|from| event.occurred_at >= from);
        type_ok && time_ok
    }
}

/// Checks a batch against the append contract before it reaches storage.
///
/// Every event must belong to `aggregate_id`, carry a unique `event_id`, and
/// continue the stream gap-free from `expected_version`.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a foreign aggregate id,
/// `DomainError::DuplicateEvent` for an id repeated inside the batch and
/// `DomainError::ConcurrencyConflict` for a version that does not follow on.
pub fn check_batch(
    aggregate_id: Uuid,
    expected_version: i64,
    events: &[StoredEvent],
) -> Result<(), DomainError> {
    let mut seen = HashSet::with_capacity(events.len());
    let mut next_version = expected_version + 1;
    for event in events {
        if event.aggregate_id != aggregate_id {
            return Err(DomainError::Validation(format!(
                "event {} belongs to aggregate {}, not {aggregate_id}",
                event.event_id, event.aggregate_id
            )));
        }
        if !seen.insert(event.event_id) {
            return Err(DomainError::DuplicateEvent(event.event_id));
        }
        if event.sequence_number != next_version {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: next_version,
                actual: event.sequence_number,
            });
        }
        next_version += 1;
    }
    Ok(())
}

/// Append-only persistence and retrieval of domain events and snapshots.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically appends a batch to an aggregate stream.
    ///
    /// `expected_version` is the version the caller loaded; the whole batch is
    /// rejected if the stored version has moved since.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` on a version mismatch,
    /// `DomainError::DuplicateEvent` if an event id already exists and
    /// `DomainError::Infrastructure` on storage failure.
    async fn save_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[StoredEvent],
    ) -> Result<(), DomainError>;

    /// Loads events for an aggregate in ascending version order, optionally
    /// only those with a version greater than `from_version`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads events for an aggregate recorded at or before `as_of`, in
    /// ascending version order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_events_as_of(
        &self,
        aggregate_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Returns the highest stored version for an aggregate, or 0.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_aggregate_version(&self, aggregate_id: Uuid) -> Result<i64, DomainError>;

    /// Persists a snapshot, replacing older snapshots of the same aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the snapshot is ahead of the event
    /// log and `DomainError::Infrastructure` on storage failure.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError>;

    /// Returns the most recent snapshot for an aggregate, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_latest_snapshot(&self, aggregate_id: Uuid)
    -> Result<Option<Snapshot>, DomainError>;

    /// Reads up to `limit` events matching `filter` strictly after `after`,
    /// ordered by `(occurred_at, event_id)`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn read_page(
        &self,
        filter: &EventFilter,
        after: Option<StreamPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Resolves an event id to its position in the global stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn stream_position(&self, event_id: Uuid)
    -> Result<Option<StreamPosition>, DomainError>;

    /// Appends a single event, expecting it to directly follow the stored
    /// version.
    ///
    /// # Errors
    ///
    /// See [`EventStore::save_events`].
    async fn save_event(&self, event: &StoredEvent) -> Result<(), DomainError> {
        self.save_events(
            event.aggregate_id,
            event.sequence_number - 1,
            std::slice::from_ref(event),
        )
        .await
    }

    /// Returns every event matching `filter`, ordered by timestamp.
    ///
    /// The log is drained page by page, so events appended during the scan
    /// never shift or duplicate earlier results.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_all_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, DomainError> {
        let mut events = Vec::new();
        let mut after = None;
        loop {
            let page = self.read_page(filter, after, ALL_EVENTS_PAGE_SIZE).await?;
            let exhausted = page.len() < ALL_EVENTS_PAGE_SIZE;
            after = page.last().map(StreamPosition::of).or(after);
            events.extend(page);
            if exhausted {
                return Ok(events);
            }
        }
    }

    /// Returns one page of the global stream following the event
    /// `from_event_id` (exclusive), or from the beginning.
    ///
    /// `limit` defaults to [`DEFAULT_STREAM_LIMIT`] and is clamped to
    /// `1..=MAX_STREAM_LIMIT`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `from_event_id` is unknown and
    /// `DomainError::Infrastructure` on storage failure.
    async fn get_event_stream(
        &self,
        from_event_id: Option<Uuid>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let limit = limit
            .unwrap_or(DEFAULT_STREAM_LIMIT)
            .clamp(1, MAX_STREAM_LIMIT);
        let after = match from_event_id {
            Some(event_id) => Some(self.stream_position(event_id).await?.ok_or_else(|| {
                DomainError::Validation(format!("unknown stream cursor: {event_id}"))
            })?),
            None => None,
        };
        self.read_page(&EventFilter::default(), after, limit).await
    }
}
