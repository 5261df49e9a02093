//! Aggregate root for the User aggregate.

use chrono::{DateTime, Utc};
use identity_core::aggregate::{AggregateRoot, UncommittedEvents};
use identity_core::error::DomainError;
use identity_core::event::EventContext;
use identity_core::store::Snapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::events::{
    USER_CREATED_EVENT_TYPE, USER_DEACTIVATED_EVENT_TYPE, USER_EMAIL_VERIFIED_EVENT_TYPE,
    USER_LOGGED_IN_EVENT_TYPE, USER_PROFILE_UPDATED_EVENT_TYPE, USER_ROLE_ADDED_EVENT_TYPE,
    UserCreated, UserDeactivated, UserEmailVerified, UserEvent, UserEventKind, UserLoggedIn,
    UserProfileUpdated, UserRoleAdded,
};

/// Lifecycle stage derived from the folded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    /// No event has been recorded yet.
    NotCreated,
    /// Created and not deactivated.
    Active,
    /// Deactivated. Not terminal, but no reactivation behavior exists.
    Deactivated,
}

/// The aggregate root for a user.
///
/// State is derived entirely from the event history; it is serializable so it
/// can be materialized as a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Aggregate identifier.
    id: Uuid,
    /// Version of the last event folded in; 0 means the user does not exist.
    version: i64,
    email: String,
    first_name: String,
    last_name: String,
    is_active: bool,
    email_verified: bool,
    /// Granted roles, unique, in grant order.
    roles: Vec<String>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

fn require_non_blank(field: &str, value: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_owned())
}

fn validate_email(email: &str) -> Result<String, DomainError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(email.to_owned())
        }
        _ => Err(DomainError::Validation(format!(
            "invalid email address: {email:?}"
        ))),
    }
}

impl User {
    /// Creates a user handle at version 0 (not yet created).
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: false,
            email_verified: false,
            roles: Vec::new(),
            last_login_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Restores a user from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the snapshot belongs to another
    /// aggregate type, or its state does not deserialize or disagrees with the
    /// snapshot's id or version.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, DomainError> {
        if snapshot.aggregate_type != Self::AGGREGATE_TYPE {
            return Err(DomainError::Infrastructure(format!(
                "snapshot of {} cannot restore a {}",
                snapshot.aggregate_type,
                Self::AGGREGATE_TYPE
            )));
        }
        let user: Self = serde_json::from_value(snapshot.state.clone())?;
        if user.id != snapshot.aggregate_id || user.version != snapshot.version {
            return Err(DomainError::Infrastructure(format!(
                "snapshot state (id {}, version {}) does not match its header (id {}, version {})",
                user.id, user.version, snapshot.aggregate_id, snapshot.version
            )));
        }
        Ok(user)
    }

    /// Materializes the current state as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a user that does not exist yet.
    pub fn to_snapshot(&self, taken_at: DateTime<Utc>) -> Result<Snapshot, DomainError> {
        if self.version == 0 {
            return Err(DomainError::Validation(format!(
                "cannot snapshot user {} before it exists",
                self.id
            )));
        }
        Ok(Snapshot {
            aggregate_id: self.id,
            aggregate_type: Self::AGGREGATE_TYPE.to_owned(),
            version: self.version,
            state: serde_json::to_value(self)?,
            taken_at,
        })
    }

    /// Email address.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Given name.
    #[must_use]
    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    /// Family name.
    #[must_use]
    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    /// Whether the user is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Whether the email address has been verified.
    #[must_use]
    pub fn email_verified(&self) -> bool {
        self.email_verified
    }

    /// Granted roles in grant order.
    #[must_use]
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Time of the most recent login.
    #[must_use]
    pub fn last_login_at(&self) -> Option<DateTime<Utc>> {
        self.last_login_at
    }

    /// Time the user was created.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Time of the most recent change.
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Lifecycle stage.
    #[must_use]
    pub fn status(&self) -> UserStatus {
        if self.version == 0 {
            UserStatus::NotCreated
        } else if self.is_active {
            UserStatus::Active
        } else {
            UserStatus::Deactivated
        }
    }

    /// Moves the version past a stored event this aggregate does not
    /// interpret, keeping the next sequence number aligned with the log.
    pub(crate) fn skip_unrecognized(&mut self, version: i64) {
        self.version = self.version.max(version);
    }

    fn ensure_exists(&self) -> Result<(), DomainError> {
        if self.version == 0 {
            return Err(DomainError::AggregateNotFound(self.id));
        }
        Ok(())
    }

    fn new_event(
        &self,
        ctx: &EventContext<'_>,
        event_type: &str,
        kind: UserEventKind,
    ) -> UserEvent {
        UserEvent {
            metadata: ctx.metadata(
                Self::AGGREGATE_TYPE,
                self.id,
                event_type,
                self.next_sequence_number(),
            ),
            kind,
        }
    }

    /// Registers the user, producing a `UserCreated` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AlreadyExists` if the user has any history and
    /// `DomainError::Validation` for a malformed email or blank name.
    pub fn create_user(
        &mut self,
        email: &str,
        first_name: &str,
        last_name: &str,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        if self.version != 0 {
            return Err(DomainError::AlreadyExists(self.id));
        }
        let payload = UserCreated {
            user_id: self.id,
            email: validate_email(email)?,
            first_name: require_non_blank("first name", first_name)?,
            last_name: require_non_blank("last name", last_name)?,
        };
        let event = self.new_event(
            ctx,
            USER_CREATED_EVENT_TYPE,
            UserEventKind::UserCreated(payload),
        );
        self.record(event, pending);
        Ok(())
    }

    /// Marks the email address verified. Does nothing if it already is.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the user does not exist.
    pub fn verify_email(
        &mut self,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        self.ensure_exists()?;
        if self.email_verified {
            return Ok(());
        }
        let event = self.new_event(
            ctx,
            USER_EMAIL_VERIFIED_EVENT_TYPE,
            UserEventKind::UserEmailVerified(UserEmailVerified { user_id: self.id }),
        );
        self.record(event, pending);
        Ok(())
    }

    /// Changes the supplied profile fields, producing a `UserProfileUpdated`
    /// event that carries only those fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the user does not exist and
    /// `DomainError::Validation` if no field is supplied or a field is blank.
    pub fn update_profile(
        &mut self,
        first_name: Option<&str>,
        last_name: Option<&str>,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        self.ensure_exists()?;
        if first_name.is_none() && last_name.is_none() {
            return Err(DomainError::Validation(
                "profile update must change at least one field".into(),
            ));
        }
        let payload = UserProfileUpdated {
            user_id: self.id,
            first_name: first_name
                .map(|name| require_non_blank("first name", name))
                .transpose()?,
            last_name: last_name
                .map(|name| require_non_blank("last name", name))
                .transpose()?,
        };
        let event = self.new_event(
            ctx,
            USER_PROFILE_UPDATED_EVENT_TYPE,
            UserEventKind::UserProfileUpdated(payload),
        );
        self.record(event, pending);
        Ok(())
    }

    /// Records a login, producing a `UserLoggedIn` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the user does not exist.
    pub fn record_login(
        &mut self,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        self.ensure_exists()?;
        let event = self.new_event(
            ctx,
            USER_LOGGED_IN_EVENT_TYPE,
            UserEventKind::UserLoggedIn(UserLoggedIn { user_id: self.id }),
        );
        self.record(event, pending);
        Ok(())
    }

    /// Deactivates the user, producing a `UserDeactivated` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the user does not exist.
    pub fn deactivate(
        &mut self,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        self.ensure_exists()?;
        let event = self.new_event(
            ctx,
            USER_DEACTIVATED_EVENT_TYPE,
            UserEventKind::UserDeactivated(UserDeactivated { user_id: self.id }),
        );
        self.record(event, pending);
        Ok(())
    }

    /// Grants a role. Does nothing if the role is already held.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the user does not exist and
    /// `DomainError::Validation` for a blank role.
    pub fn add_role(
        &mut self,
        role: &str,
        ctx: &EventContext<'_>,
        pending: &mut UncommittedEvents<UserEvent>,
    ) -> Result<(), DomainError> {
        self.ensure_exists()?;
        let role = require_non_blank("role", role)?;
        if self.roles.contains(&role) {
            return Ok(());
        }
        let event = self.new_event(
            ctx,
            USER_ROLE_ADDED_EVENT_TYPE,
            UserEventKind::UserRoleAdded(UserRoleAdded {
                user_id: self.id,
                role,
            }),
        );
        self.record(event, pending);
        Ok(())
    }
}

impl AggregateRoot for User {
    type Event = UserEvent;

    const AGGREGATE_TYPE: &'static str = "User";

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        let version = event.metadata.sequence_number;
        if version <= self.version {
            debug!(
                aggregate_id = %self.id,
                version,
                current = self.version,
                "event already folded; skipping"
            );
            return;
        }
        let at = event.metadata.occurred_at;
        match &event.kind {
            UserEventKind::UserCreated(payload) => {
                self.email.clone_from(&payload.email);
                self.first_name.clone_from(&payload.first_name);
                self.last_name.clone_from(&payload.last_name);
                self.is_active = true;
                self.created_at = Some(at);
            }
            UserEventKind::UserEmailVerified(_) => {
                self.email_verified = true;
            }
            UserEventKind::UserProfileUpdated(payload) => {
                if let Some(first_name) = &payload.first_name {
                    self.first_name.clone_from(first_name);
                }
                if let Some(last_name) = &payload.last_name {
                    self.last_name.clone_from(last_name);
                }
            }
            UserEventKind::UserLoggedIn(_) => {
                self.last_login_at = Some(at);
            }
            UserEventKind::UserDeactivated(_) => {
                self.is_active = false;
            }
            UserEventKind::UserRoleAdded(payload) => {
                if !self.roles.contains(&payload.role) {
                    self.roles.push(payload.role.clone());
                }
            }
        }
        self.updated_at = Some(at);
        self.version = version;
    }
}
