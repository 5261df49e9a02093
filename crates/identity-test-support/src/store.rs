//! Test stores: mock `EventStore` implementations for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use identity_core::error::DomainError;
use identity_core::store::{EventFilter, EventStore, Snapshot, StoredEvent, StreamPosition};
use uuid::Uuid;

/// An event store that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventStore;

fn connection_refused() -> DomainError {
    DomainError::Infrastructure("connection refused".into())
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn save_events(
        &self,
        _aggregate_id: Uuid,
        _expected_version: i64,
        _events: &[StoredEvent],
    ) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn get_events(
        &self,
        _aggregate_id: Uuid,
        _from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn get_events_as_of(
        &self,
        _aggregate_id: Uuid,
        _as_of: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn get_aggregate_version(&self, _aggregate_id: Uuid) -> Result<i64, DomainError> {
        Err(connection_refused())
    }

    async fn save_snapshot(&self, _snapshot: &Snapshot) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn get_latest_snapshot(
        &self,
        _aggregate_id: Uuid,
    ) -> Result<Option<Snapshot>, DomainError> {
        Err(connection_refused())
    }

    async fn read_page(
        &self,
        _filter: &EventFilter,
        _after: Option<StreamPosition>,
        _limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn stream_position(
        &self,
        _event_id: Uuid,
    ) -> Result<Option<StreamPosition>, DomainError> {
        Err(connection_refused())
    }
}
