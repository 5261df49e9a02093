//! Domain events for the User aggregate.

use identity_core::error::DomainError;
use identity_core::event::{DomainEvent, EventMetadata};
use identity_core::store::StoredEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type tag for [`UserCreated`].
pub const USER_CREATED_EVENT_TYPE: &str = "UserCreated";
/// Event type tag for [`UserEmailVerified`].
pub const USER_EMAIL_VERIFIED_EVENT_TYPE: &str = "UserEmailVerified";
/// Event type tag for [`UserProfileUpdated`].
pub const USER_PROFILE_UPDATED_EVENT_TYPE: &str = "UserProfileUpdated";
/// Event type tag for [`UserLoggedIn`].
pub const USER_LOGGED_IN_EVENT_TYPE: &str = "UserLoggedIn";
/// Event type tag for [`UserDeactivated`].
pub const USER_DEACTIVATED_EVENT_TYPE: &str = "UserDeactivated";
/// Event type tag for [`UserRoleAdded`].
pub const USER_ROLE_ADDED_EVENT_TYPE: &str = "UserRoleAdded";

/// Emitted when a user is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    /// The user identifier.
    pub user_id: Uuid,
    /// Email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

/// Emitted the first time a user's email address is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEmailVerified {
    /// The user identifier.
    pub user_id: Uuid,
}

/// Emitted when profile fields change. Only supplied fields are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileUpdated {
    /// The user identifier.
    pub user_id: Uuid,
    /// New given name, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// New family name, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Emitted on every successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoggedIn {
    /// The user identifier.
    pub user_id: Uuid,
}

/// Emitted when a user is deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeactivated {
    /// The user identifier.
    pub user_id: Uuid,
}

/// Emitted when a role is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoleAdded {
    /// The user identifier.
    pub user_id: Uuid,
    /// The granted role.
    pub role: String,
}

/// Event payload variants for the User aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEventKind {
    /// A user has been registered.
    UserCreated(UserCreated),
    /// The user's email has been verified.
    UserEmailVerified(UserEmailVerified),
    /// Profile fields have changed.
    UserProfileUpdated(UserProfileUpdated),
    /// The user logged in.
    UserLoggedIn(UserLoggedIn),
    /// The user has been deactivated.
    UserDeactivated(UserDeactivated),
    /// A role has been granted.
    UserRoleAdded(UserRoleAdded),
}

/// Domain event envelope for the User aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: UserEventKind,
}

fn decode<T: DeserializeOwned>(stored: &StoredEvent) -> Result<T, DomainError> {
    serde_json::from_value(stored.payload.clone()).map_err(|e| {
        DomainError::Infrastructure(format!(
            "event {} ({}) deserialization failed: {e}",
            stored.event_id, stored.event_type
        ))
    })
}

fn encode<T: Serialize>(payload: &T) -> serde_json::Value {
    // Serialization of derived Serialize types to Value is infallible.
    serde_json::to_value(payload).expect("user event payload serialization is infallible")
}

impl UserEvent {
    /// Rebuilds a typed event from its stored form.
    ///
    /// Returns `Ok(None)` for event types this aggregate does not know, so
    /// newer writers do not break older readers.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if a known event type carries a
    /// payload that does not deserialize.
    pub fn from_stored(stored: &StoredEvent) -> Result<Option<Self>, DomainError> {
        let kind = match stored.event_type.as_str() {
            USER_CREATED_EVENT_TYPE => UserEventKind::UserCreated(decode(stored)?),
            USER_EMAIL_VERIFIED_EVENT_TYPE => UserEventKind::UserEmailVerified(decode(stored)?),
            USER_PROFILE_UPDATED_EVENT_TYPE => UserEventKind::UserProfileUpdated(decode(stored)?),
            USER_LOGGED_IN_EVENT_TYPE => UserEventKind::UserLoggedIn(decode(stored)?),
            USER_DEACTIVATED_EVENT_TYPE => UserEventKind::UserDeactivated(decode(stored)?),
            USER_ROLE_ADDED_EVENT_TYPE => UserEventKind::UserRoleAdded(decode(stored)?),
            _ => return Ok(None),
        };
        Ok(Some(Self {
            metadata: EventMetadata::from(stored),
            kind,
        }))
    }
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            UserEventKind::UserCreated(_) => USER_CREATED_EVENT_TYPE,
            UserEventKind::UserEmailVerified(_) => USER_EMAIL_VERIFIED_EVENT_TYPE,
            UserEventKind::UserProfileUpdated(_) => USER_PROFILE_UPDATED_EVENT_TYPE,
            UserEventKind::UserLoggedIn(_) => USER_LOGGED_IN_EVENT_TYPE,
            UserEventKind::UserDeactivated(_) => USER_DEACTIVATED_EVENT_TYPE,
            UserEventKind::UserRoleAdded(_) => USER_ROLE_ADDED_EVENT_TYPE,
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        match &self.kind {
            UserEventKind::UserCreated(payload) => encode(payload),
            UserEventKind::UserEmailVerified(payload) => encode(payload),
            UserEventKind::UserProfileUpdated(payload) => encode(payload),
            UserEventKind::UserLoggedIn(payload) => encode(payload),
            UserEventKind::UserDeactivated(payload) => encode(payload),
            UserEventKind::UserRoleAdded(payload) => encode(payload),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
