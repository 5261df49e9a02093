//! `PostgreSQL` implementation of the `EventStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use identity_core::error::DomainError;
use identity_core::store::{
    EventFilter, EventStore, Snapshot, StoredEvent, StreamPosition, check_batch,
};

const EVENT_COLUMNS: &str = "event_id, aggregate_id, aggregate_type, event_type, payload, \
     sequence_number, user_id, correlation_id, causation_id, occurred_at";

const EVENT_ID_CONSTRAINT: &str = "domain_events_pkey";

/// PostgreSQL-backed event store.
///
/// Appends run in one transaction holding a per-aggregate advisory lock, so
/// the version check and the inserts cannot interleave with another writer.
/// The `(aggregate_id, sequence_number)` unique constraint backs this up for
/// writers that bypass the lock.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if a migration fails.
    pub async fn run_migrations(&self) -> Result<(), DomainError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::Infrastructure(format!("migration failed: {e}")))
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: Uuid,
    ) -> Result<i64, DomainError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM domain_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(infrastructure)
    }

    async fn lock_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: Uuid,
    ) -> Result<(), DomainError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(aggregate_id)
            .execute(&mut **tx)
            .await
            .map_err(infrastructure)?;
        Ok(())
    }
}

fn infrastructure(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(format!("database error: {err}"))
}

/// Maps an insert failure to the append contract's error kinds.
fn insert_error(err: sqlx::Error, expected_version: i64, event: &StoredEvent) -> DomainError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            if db_err.constraint() == Some(EVENT_ID_CONSTRAINT) {
                return DomainError::DuplicateEvent(event.event_id);
            }
            return DomainError::ConcurrencyConflict {
                aggregate_id: event.aggregate_id,
                expected: expected_version,
                actual: event.sequence_number,
            };
        }
    }
    infrastructure(err)
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, DomainError> {
    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(infrastructure)?,
        aggregate_id: row.try_get("aggregate_id").map_err(infrastructure)?,
        aggregate_type: row.try_get("aggregate_type").map_err(infrastructure)?,
        event_type: row.try_get("event_type").map_err(infrastructure)?,
        payload: row.try_get("payload").map_err(infrastructure)?,
        sequence_number: row.try_get("sequence_number").map_err(infrastructure)?,
        user_id: row.try_get("user_id").map_err(infrastructure)?,
        correlation_id: row.try_get("correlation_id").map_err(infrastructure)?,
        causation_id: row.try_get("causation_id").map_err(infrastructure)?,
        occurred_at: row.try_get("occurred_at").map_err(infrastructure)?,
    })
}

fn rows_to_events(rows: &[PgRow]) -> Result<Vec<StoredEvent>, DomainError> {
    rows.iter().map(row_to_event).collect()
}

#[async_trait]
impl EventStore for PgEventStore {
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

        let mut tx = self.pool.begin().await.map_err(infrastructure)?;
        Self::lock_aggregate(&mut tx, aggregate_id).await?;

        let actual = Self::current_version(&mut tx, aggregate_id).await?;
        if actual != expected_version {
            warn!(%aggregate_id, expected_version, actual, "rejected stale append");
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        for event in events {
            sqlx::query(
                "INSERT INTO domain_events (event_id, aggregate_id, aggregate_type, event_type, \
                 payload, sequence_number, user_id, correlation_id, causation_id, occurred_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(event.event_id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.sequence_number)
            .bind(event.user_id)
            .bind(event.correlation_id)
            .bind(event.causation_id)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error(e, expected_version, event))?;
        }

        tx.commit().await.map_err(infrastructure)?;
        debug!(%aggregate_id, count = events.len(), "appended events");
        Ok(())
    }

    async fn get_events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE aggregate_id = $1 AND sequence_number > $2 \
             ORDER BY sequence_number"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id)
            .bind(from_version.unwrap_or(0))
            .fetch_all(&self.pool)
            .await
            .map_err(infrastructure)?;
        rows_to_events(&rows)
    }

    async fn get_events_as_of(
        &self,
        aggregate_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE aggregate_id = $1 AND occurred_at <= $2 \
             ORDER BY sequence_number"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id)
            .bind(as_of)
            .fetch_all(&self.pool)
            .await
            .map_err(infrastructure)?;
        rows_to_events(&rows)
    }

    async fn get_aggregate_version(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM domain_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(infrastructure)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(infrastructure)?;
        let current = Self::current_version(&mut tx, snapshot.aggregate_id).await?;
        if snapshot.version < 1 || snapshot.version > current {
            return Err(DomainError::Validation(format!(
                "snapshot version {} is outside the event log of aggregate {} (version {current})",
                snapshot.version, snapshot.aggregate_id
            )));
        }

        sqlx::query(
            "INSERT INTO aggregate_snapshots \
                 (aggregate_id, aggregate_type, version, state, taken_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (aggregate_id, version) \
             DO UPDATE SET aggregate_type = EXCLUDED.aggregate_type, \
                           state = EXCLUDED.state, \
                           taken_at = EXCLUDED.taken_at",
        )
        .bind(snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version)
        .bind(&snapshot.state)
        .bind(snapshot.taken_at)
        .execute(&mut *tx)
        .await
        .map_err(infrastructure)?;

        sqlx::query("DELETE FROM aggregate_snapshots WHERE aggregate_id = $1 AND version < $2")
            .bind(snapshot.aggregate_id)
            .bind(snapshot.version)
            .execute(&mut *tx)
            .await
            .map_err(infrastructure)?;

        tx.commit().await.map_err(infrastructure)?;
        debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "saved snapshot"
        );
        Ok(())
    }

    async fn get_latest_snapshot(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            "SELECT aggregate_id, aggregate_type, version, state, taken_at \
             FROM aggregate_snapshots WHERE aggregate_id = $1 \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.map(|row| {
            Ok(Snapshot {
                aggregate_id: row.try_get("aggregate_id").map_err(infrastructure)?,
                aggregate_type: row.try_get("aggregate_type").map_err(infrastructure)?,
                version: row.try_get("version").map_err(infrastructure)?,
                state: row.try_get("state").map_err(infrastructure)?,
                taken_at: row.try_get("taken_at").map_err(infrastructure)?,
            })
        })
        .transpose()
    }

    async fn read_page(
        &self,
        filter: &EventFilter,
        after: Option<StreamPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE ($1::text[] IS NULL OR event_type = ANY($1)) \
               AND ($2::timestamptz IS NULL OR occurred_at >= $2) \
               AND ($3::timestamptz IS NULL OR (occurred_at, event_id) > ($3, $4::uuid)) \
             ORDER BY occurred_at, event_id \
             LIMIT $5"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.event_types.clone())
            .bind(filter.from_timestamp)
            .bind(after.map(|p| p.occurred_at))
            .bind(after.map(|p| p.event_id))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(infrastructure)?;
        rows_to_events(&rows)
    }

    async fn stream_position(
        &self,
        event_id: Uuid,
    ) -> Result<Option<StreamPosition>, DomainError> {
        let row = sqlx::query("SELECT occurred_at, event_id FROM domain_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infrastructure)?;

        row.map(|row| {
            Ok(StreamPosition {
                occurred_at: row.try_get("occurred_at").map_err(infrastructure)?,
                event_id: row.try_get("event_id").map_err(infrastructure)?,
            })
        })
        .transpose()
    }
}
