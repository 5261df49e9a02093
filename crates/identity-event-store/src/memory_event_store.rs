//! In-process implementation of the `EventStore` trait.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use identity_core::error::DomainError;
use identity_core::store::{
    EventFilter, EventStore, Snapshot, StoredEvent, StreamPosition, check_batch,
};

#[derive(Debug, Default)]
struct Inner {
    /// Per-aggregate streams, each ordered by sequence number.
    streams: HashMap<Uuid, Vec<StoredEvent>>,
    /// Global log ordered by `(occurred_at, event_id)`.
    global: BTreeMap<StreamPosition, StoredEvent>,
    /// Event id index; doubles as the duplicate check.
    positions: HashMap<Uuid, StreamPosition>,
    /// Latest snapshot per aggregate.
    snapshots: HashMap<Uuid, Snapshot>,
}

impl Inner {
    fn version_of(&self, aggregate_id: Uuid) -> i64 {
        self.streams
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(0, |event| event.sequence_number)
    }
}

/// Mutex-guarded event store for a single writer process.
///
/// The version check and the append happen under one lock, which gives the
/// same all-or-nothing, compare-and-swap behavior as the PostgreSQL store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DomainError> {
        self.inner
            .lock()
            .map_err(|_| DomainError::Infrastructure("event store lock poisoned".into()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[StoredEvent],
    ) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }
        check_batch(aggregate_id, expected_version, events)?;

        let mut inner = self.lock()?;
        let actual = inner.version_of(aggregate_id);
        if actual != expected_version {
            warn!(%aggregate_id, expected_version, actual, "rejected stale append");
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }
        if let Some(existing) = events
            .iter()
            .find(|event| inner.positions.contains_key(&event.event_id))
        {
            return Err(DomainError::DuplicateEvent(existing.event_id));
        }

        for event in events {
            let position = StreamPosition::of(event);
            inner.positions.insert(event.event_id, position);
            inner.global.insert(position, event.clone());
        }
        inner
            .streams
            .entry(aggregate_id)
            .or_default()
            .extend_from_slice(events);

        debug!(
            %aggregate_id,
            version = expected_version + i64::try_from(events.len()).unwrap_or(i64::MAX),
            "appended events"
        );
        Ok(())
    }

    async fn get_events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let inner = self.lock()?;
        let floor = from_version.unwrap_or(0);
        Ok(inner
            .streams
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.sequence_number > floor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_events_as_of(
        &self,
        aggregate_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.occurred_at <= as_of)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_aggregate_version(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        Ok(self.lock()?.version_of(aggregate_id))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        let mut inner = self.lock()?;
        let current = inner.version_of(snapshot.aggregate_id);
        if snapshot.version < 1 || snapshot.version > current {
            return Err(DomainError::Validation(format!(
                "snapshot version {} is outside the event log of aggregate {} (version {current})",
                snapshot.version, snapshot.aggregate_id
            )));
        }
        let newer_exists = inner
            .snapshots
            .get(&snapshot.aggregate_id)
            .is_some_and(|existing| existing.version > snapshot.version);
        if newer_exists {
            debug!(
                aggregate_id = %snapshot.aggregate_id,
                version = snapshot.version,
                "newer snapshot already stored; keeping it"
            );
            return Ok(());
        }
        inner
            .snapshots
            .insert(snapshot.aggregate_id, snapshot.clone());
        Ok(())
    }

    async fn get_latest_snapshot(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<Snapshot>, DomainError> {
        Ok(self.lock()?.snapshots.get(&aggregate_id).cloned())
    }

    async fn read_page(
        &self,
        filter: &EventFilter,
        after: Option<StreamPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let inner = self.lock()?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(inner
            .global
            .range((lower, Bound::Unbounded))
            .map(|(_, event)| event)
            .filter(|event| filter.matches(event))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stream_position(
        &self,
        event_id: Uuid,
    ) -> Result<Option<StreamPosition>, DomainError> {
        Ok(self.lock()?.positions.get(&event_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use identity_core::fold::{EventHandlers, rebuild_aggregate_state};

    use super::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    /// Helper to build a `StoredEvent` with sensible defaults.
    fn make_stored_event(aggregate_id: Uuid, sequence_number: i64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: "Test".to_owned(),
            event_type: "TestEvent".to_owned(),
            payload: serde_json::json!({"key": "value"}),
            sequence_number,
            user_id: None,
            correlation_id: Some(Uuid::new_v4()),
            causation_id: None,
            occurred_at: base_time() + Duration::seconds(sequence_number),
        }
    }

    fn make_snapshot(aggregate_id: Uuid, version: i64) -> Snapshot {
        Snapshot {
            aggregate_id,
            aggregate_type: "Test".to_owned(),
            version,
            state: serde_json::json!({ "version": version }),
            taken_at: base_time(),
        }
    }

    // --- get_events ---

    #[tokio::test]
    async fn test_get_events_returns_empty_vec_for_nonexistent_aggregate() {
        let store = InMemoryEventStore::new();

        let events = store.get_events(Uuid::new_v4(), None).await.unwrap();

        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_get_events_from_version_returns_only_later_events() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let events: Vec<StoredEvent> = (1..=4)
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        store.save_events(aggregate_id, 0, &events).await.unwrap();

        let tail = store.get_events(aggregate_id, Some(2)).await.unwrap();

        let versions: Vec<i64> = tail.iter().map(|e| e.sequence_number).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    // --- save_events ---

    #[tokio::test]
    async fn test_sequential_appends_with_correct_expected_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();

        store
            .save_events(
                aggregate_id,
                0,
                &[
                    make_stored_event(aggregate_id, 1),
                    make_stored_event(aggregate_id, 2),
                ],
            )
            .await
            .unwrap();
        store
            .save_events(aggregate_id, 2, &[make_stored_event(aggregate_id, 3)])
            .await
            .unwrap();

        let loaded = store.get_events(aggregate_id, None).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(store.get_aggregate_version(aggregate_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_rejected_without_writing() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        store
            .save_events(aggregate_id, 0, &[make_stored_event(aggregate_id, 1)])
            .await
            .unwrap();

        let result = store
            .save_events(aggregate_id, 0, &[make_stored_event(aggregate_id, 1)])
            .await;

        match result {
            Err(DomainError::ConcurrencyConflict {
                aggregate_id: conflict_agg_id,
                expected,
                actual,
            }) => {
                assert_eq!(conflict_agg_id, aggregate_id);
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        assert_eq!(store.get_events(aggregate_id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_rejected() {
        let store = InMemoryEventStore::new();
        let agg_a = Uuid::new_v4();
        let agg_b = Uuid::new_v4();
        let first = make_stored_event(agg_a, 1);
        store.save_event(&first).await.unwrap();

        let mut copy = make_stored_event(agg_b, 1);
        copy.event_id = first.event_id;
        let result = store.save_event(&copy).await;

        match result {
            Err(DomainError::DuplicateEvent(id)) => assert_eq!(id, first.event_id),
            other => panic!("expected DuplicateEvent, got {other:?}"),
        }
        assert_eq!(store.get_aggregate_version(agg_b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let existing = make_stored_event(Uuid::new_v4(), 1);
        store.save_event(&existing).await.unwrap();

        let mut second = make_stored_event(aggregate_id, 2);
        second.event_id = existing.event_id;
        let result = store
            .save_events(
                aggregate_id,
                0,
                &[make_stored_event(aggregate_id, 1), second],
            )
            .await;

        assert!(matches!(result, Err(DomainError::DuplicateEvent(_))));
        assert!(store.get_events(aggregate_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_event_rejects_version_gap() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();

        let result = store.save_event(&make_stored_event(aggregate_id, 2)).await;

        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict { expected: 1, actual: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_append_empty_events_is_noop() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();

        store.save_events(aggregate_id, 0, &[]).await.unwrap();

        assert!(store.get_events(aggregate_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_at_same_version_admit_exactly_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let aggregate_id = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .save_events(aggregate_id, 0, &[make_stored_event(aggregate_id, 1)])
                    .await
            }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(store.get_events(aggregate_id, None).await.unwrap().len(), 1);
    }

    // --- temporal query ---

    #[tokio::test]
    async fn test_get_events_as_of_excludes_later_events() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let events: Vec<StoredEvent> = (1..=3)
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        store.save_events(aggregate_id, 0, &events).await.unwrap();

        let as_of = events[1].occurred_at;
        let visible = store.get_events_as_of(aggregate_id, as_of).await.unwrap();

        let versions: Vec<i64> = visible.iter().map(|e| e.sequence_number).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    // --- global scans ---

    #[tokio::test]
    async fn test_get_all_events_filters_by_type_and_time() {
        let store = InMemoryEventStore::new();
        let agg_a = Uuid::new_v4();
        let agg_b = Uuid::new_v4();
        let mut a1 = make_stored_event(agg_a, 1);
        a1.event_type = "Created".to_owned();
        let mut b1 = make_stored_event(agg_b, 1);
        b1.event_type = "Created".to_owned();
        b1.occurred_at = base_time() + Duration::seconds(10);
        let a2 = make_stored_event(agg_a, 2);
        store.save_events(agg_a, 0, &[a1.clone(), a2]).await.unwrap();
        store.save_events(agg_b, 0, &[b1.clone()]).await.unwrap();

        let created = store
            .get_all_events(&EventFilter::default().with_event_types(["Created"]))
            .await
            .unwrap();
        let recent = store
            .get_all_events(
                &EventFilter::default().with_from_timestamp(base_time() + Duration::seconds(5)),
            )
            .await
            .unwrap();

        assert_eq!(created, vec![a1, b1.clone()]);
        assert_eq!(recent, vec![b1]);
    }

    #[tokio::test]
    async fn test_get_all_events_drains_more_than_one_page() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let total = identity_core::store::ALL_EVENTS_PAGE_SIZE + 7;
        let events: Vec<StoredEvent> = (1..=i64::try_from(total).unwrap())
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        store.save_events(aggregate_id, 0, &events).await.unwrap();

        let all = store.get_all_events(&EventFilter::default()).await.unwrap();

        assert_eq!(all.len(), total);
        assert_eq!(all.last().unwrap().sequence_number, i64::try_from(total).unwrap());
    }

    #[tokio::test]
    async fn test_event_stream_pages_with_stable_cursor() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let events: Vec<StoredEvent> = (1..=5)
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        store.save_events(aggregate_id, 0, &events).await.unwrap();

        let first = store.get_event_stream(None, Some(2)).await.unwrap();
        // A concurrent append between pages must not shift the next page.
        let other = Uuid::new_v4();
        let mut late = make_stored_event(other, 1);
        late.occurred_at = base_time() + Duration::days(1);
        store.save_event(&late).await.unwrap();
        let second = store
            .get_event_stream(Some(first[1].event_id), Some(2))
            .await
            .unwrap();

        assert_eq!(first, events[0..2].to_vec());
        assert_eq!(second, events[2..4].to_vec());
    }

    #[tokio::test]
    async fn test_event_stream_ties_on_timestamp_break_by_event_id() {
        let store = InMemoryEventStore::new();
        let agg_a = Uuid::new_v4();
        let agg_b = Uuid::new_v4();
        let mut a = make_stored_event(agg_a, 1);
        a.event_id = Uuid::from_u128(2);
        let mut b = make_stored_event(agg_b, 1);
        b.event_id = Uuid::from_u128(1);
        b.occurred_at = a.occurred_at;
        store.save_event(&a).await.unwrap();
        store.save_event(&b).await.unwrap();

        let page = store.get_event_stream(None, None).await.unwrap();
        let after_b = store.get_event_stream(Some(b.event_id), None).await.unwrap();

        assert_eq!(page, vec![b, a.clone()]);
        assert_eq!(after_b, vec![a]);
    }

    #[tokio::test]
    async fn test_event_stream_rejects_unknown_cursor() {
        let store = InMemoryEventStore::new();

        let result = store.get_event_stream(Some(Uuid::new_v4()), None).await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    // --- snapshots ---

    #[tokio::test]
    async fn test_latest_snapshot_overwrites_older_one() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let events: Vec<StoredEvent> = (1..=3)
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        store.save_events(aggregate_id, 0, &events).await.unwrap();

        store.save_snapshot(&make_snapshot(aggregate_id, 2)).await.unwrap();
        store.save_snapshot(&make_snapshot(aggregate_id, 3)).await.unwrap();
        store.save_snapshot(&make_snapshot(aggregate_id, 1)).await.unwrap();

        let latest = store.get_latest_snapshot(aggregate_id).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
    }

    #[tokio::test]
    async fn test_snapshot_ahead_of_event_log_is_rejected() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        store.save_event(&make_stored_event(aggregate_id, 1)).await.unwrap();

        let result = store.save_snapshot(&make_snapshot(aggregate_id, 2)).await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(store.get_latest_snapshot(aggregate_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshots_do_not_appear_in_event_log() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        store.save_event(&make_stored_event(aggregate_id, 1)).await.unwrap();

        store.save_snapshot(&make_snapshot(aggregate_id, 1)).await.unwrap();

        assert_eq!(store.get_events(aggregate_id, None).await.unwrap().len(), 1);
        assert_eq!(
            store.get_all_events(&EventFilter::default()).await.unwrap().len(),
            1
        );
    }

    // --- rebuild_aggregate_state ---

    #[tokio::test]
    async fn test_rebuild_aggregate_state_folds_stored_history() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();
        let mut events: Vec<StoredEvent> = (1..=3)
            .map(|v| make_stored_event(aggregate_id, v))
            .collect();
        events[2].event_type = "FutureEvent".to_owned();
        store.save_events(aggregate_id, 0, &events).await.unwrap();
        let handlers = EventHandlers::new()
            .on("TestEvent", |mut seen: Vec<i64>, e: &StoredEvent| {
                seen.push(e.sequence_number);
                seen
            });

        let first = rebuild_aggregate_state(&store, aggregate_id, &handlers, Vec::new())
            .await
            .unwrap();
        let second = rebuild_aggregate_state(&store, aggregate_id, &handlers, Vec::new())
            .await
            .unwrap();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(first, second);
    }
}
