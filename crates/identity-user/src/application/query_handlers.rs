//! Query handlers for the User aggregate.
//!
//! Loading, snapshotting and temporal reconstruction. All of them derive
//! state from the event store; nothing here writes events.

use chrono::{DateTime, Utc};
use identity_core::aggregate::AggregateRoot;
use identity_core::clock::Clock;
use identity_core::error::DomainError;
use identity_core::store::{EventStore, Snapshot, StoredEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::aggregates::{User, UserStatus};
use crate::domain::events::UserEvent;

/// Read model returned by [`get_user`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    /// The user identifier.
    pub user_id: Uuid,
    /// Version of the last applied event.
    pub version: i64,
    /// Lifecycle stage.
    pub status: UserStatus,
    /// Email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Whether the user is active.
    pub is_active: bool,
    /// Whether the email address has been verified.
    pub email_verified: bool,
    /// Granted roles in grant order.
    pub roles: Vec<String>,
    /// Time of the most recent login.
    pub last_login_at: Option<DateTime<Utc>>,
    /// Time the user was created.
    pub created_at: Option<DateTime<Utc>>,
    /// Time of the most recent change.
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.aggregate_id(),
            version: user.version(),
            status: user.status(),
            email: user.email().to_owned(),
            first_name: user.first_name().to_owned(),
            last_name: user.last_name().to_owned(),
            is_active: user.is_active(),
            email_verified: user.email_verified(),
            roles: user.roles().to_vec(),
            last_login_at: user.last_login_at(),
            created_at: user.created_at(),
            updated_at: user.updated_at(),
        }
    }
}

/// Folds `events` on top of `user` through [`AggregateRoot::apply`].
///
/// Typed replay rather than `identity_core::fold`, which serves projections.
fn replay(mut user: User, events: &[StoredEvent]) -> Result<User, DomainError> {
    for stored in events {
        if let Some(event) = UserEvent::from_stored(stored)? {
            user.apply(&event);
        } else {
            warn!(
                aggregate_id = %stored.aggregate_id,
                event_type = %stored.event_type,
                version = stored.sequence_number,
                "unrecognized user event type; state passed through"
            );
            user.skip_unrecognized(stored.sequence_number);
        }
    }
    Ok(user)
}

/// Reconstitutes a `User` from its complete event history.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if event deserialization fails.
pub fn reconstitute(user_id: Uuid, events: &[StoredEvent]) -> Result<User, DomainError> {
    replay(User::new(user_id), events)
}

/// Loads the current state of a user from its latest snapshot plus every
/// later event, or from the full history when there is no usable snapshot.
///
/// A user with no history comes back at version 0.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the store fails or an event
/// cannot be deserialized.
pub async fn load_user(store: &dyn EventStore, user_id: Uuid) -> Result<User, DomainError> {
    let (base, from_version) = match store.get_latest_snapshot(user_id).await? {
        Some(snapshot) => match User::from_snapshot(&snapshot) {
            Ok(user) => {
                let version = user.version();
                (user, Some(version))
            }
            Err(e) => {
                warn!(
                    aggregate_id = %user_id,
                    version = snapshot.version,
                    error = %e,
                    "discarding unusable snapshot; replaying full history"
                );
                (User::new(user_id), None)
            }
        },
        None => (User::new(user_id), None),
    };

    let tail = store.get_events(user_id, from_version).await?;
    let user = replay(base, &tail)?;
    debug!(
        aggregate_id = %user_id,
        version = user.version(),
        snapshot_version = ?from_version,
        replayed = tail.len(),
        "loaded user"
    );
    Ok(user)
}

/// Returns the current read model of an existing user.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the user has no history, or
/// any error from [`load_user`].
pub async fn get_user(store: &dyn EventStore, user_id: Uuid) -> Result<UserView, DomainError> {
    let user = load_user(store, user_id).await?;
    if user.version() == 0 {
        return Err(DomainError::AggregateNotFound(user_id));
    }
    Ok(UserView::from(&user))
}

/// Reconstructs a user as it was at `as_of`, using only events that had
/// occurred by then.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the store fails or an event
/// cannot be deserialized.
pub async fn get_user_state_as_of(
    store: &dyn EventStore,
    user_id: Uuid,
    as_of: DateTime<Utc>,
) -> Result<User, DomainError> {
    let events = store.get_events_as_of(user_id, as_of).await?;
    reconstitute(user_id, &events)
}

/// Saves a snapshot of `user` at its current version.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a user with no history or a version
/// the store has not reached, and `DomainError::Infrastructure` if the store
/// fails.
pub async fn take_snapshot(
    store: &dyn EventStore,
    user: &User,
    clock: &dyn Clock,
) -> Result<Snapshot, DomainError> {
    let snapshot = user.to_snapshot(clock.now())?;
    store.save_snapshot(&snapshot).await?;
    info!(
        aggregate_id = %snapshot.aggregate_id,
        version = snapshot.version,
        "took snapshot"
    );
    Ok(snapshot)
}
