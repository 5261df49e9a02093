//! Commands for the User aggregate.

use identity_core::command::{Command, CommandMetadata};
use identity_core::error::DomainError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Command type tag for [`CreateUser`].
pub const CREATE_USER_COMMAND_TYPE: &str = "CreateUser";
/// Command type tag for email verification.
pub const VERIFY_EMAIL_COMMAND_TYPE: &str = "VerifyEmail";
/// Command type tag for [`UpdateProfile`].
pub const UPDATE_PROFILE_COMMAND_TYPE: &str = "UpdateProfile";
/// Command type tag for login recording.
pub const RECORD_LOGIN_COMMAND_TYPE: &str = "RecordLogin";
/// Command type tag for deactivation.
pub const DEACTIVATE_COMMAND_TYPE: &str = "Deactivate";
/// Command type tag for [`AddRole`].
pub const ADD_ROLE_COMMAND_TYPE: &str = "AddRole";

/// Payload of a request to register a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUser {
    /// Email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

/// Payload of a request to change profile fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProfile {
    /// New given name.
    #[serde(default)]
    pub first_name: Option<String>,
    /// New family name.
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Payload of a request to grant a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRole {
    /// Role to grant.
    pub role: String,
}

/// Every request the User aggregate understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommandKind {
    /// Register a new user.
    CreateUser(CreateUser),
    /// Mark the email address verified.
    VerifyEmail,
    /// Change profile fields.
    UpdateProfile(UpdateProfile),
    /// Record a login.
    RecordLogin,
    /// Deactivate the user.
    Deactivate,
    /// Grant a role.
    AddRole(AddRole),
}

/// A typed command targeting one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCommand {
    /// Request identifier; becomes the causation id of produced events.
    pub command_id: Uuid,
    /// Target user. `None` is accepted only for `CreateUser`, where it asks
    /// for a freshly generated id.
    pub aggregate_id: Option<Uuid>,
    /// Request metadata.
    pub metadata: CommandMetadata,
    /// What to do.
    pub kind: UserCommandKind,
}

impl Command for UserCommand {
    fn command_type(&self) -> &'static str {
        match self.kind {
            UserCommandKind::CreateUser(_) => CREATE_USER_COMMAND_TYPE,
            UserCommandKind::VerifyEmail => VERIFY_EMAIL_COMMAND_TYPE,
            UserCommandKind::UpdateProfile(_) => UPDATE_PROFILE_COMMAND_TYPE,
            UserCommandKind::RecordLogin => RECORD_LOGIN_COMMAND_TYPE,
            UserCommandKind::Deactivate => DEACTIVATE_COMMAND_TYPE,
            UserCommandKind::AddRole(_) => ADD_ROLE_COMMAND_TYPE,
        }
    }

    fn command_id(&self) -> Uuid {
        self.command_id
    }

    fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }
}

/// A command as it arrives from outside the process: a string tag and an
/// untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    /// Request identifier.
    pub command_id: Uuid,
    /// Command type tag, e.g. `"CreateUser"`.
    pub command_type: String,
    /// Target user, if any.
    #[serde(default)]
    pub aggregate_id: Option<Uuid>,
    /// Command-specific arguments.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Request metadata.
    pub metadata: CommandMetadata,
}

fn decode<T: DeserializeOwned>(raw: &RawCommand) -> Result<T, DomainError> {
    serde_json::from_value(raw.payload.clone()).map_err(|e| {
        DomainError::Validation(format!(
            "invalid {} payload: {e}",
            raw.command_type
        ))
    })
}

impl TryFrom<RawCommand> for UserCommand {
    type Error = DomainError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let kind = match raw.command_type.as_str() {
            CREATE_USER_COMMAND_TYPE => UserCommandKind::CreateUser(decode(&raw)?),
            VERIFY_EMAIL_COMMAND_TYPE => UserCommandKind::VerifyEmail,
            UPDATE_PROFILE_COMMAND_TYPE => UserCommandKind::UpdateProfile(decode(&raw)?),
            RECORD_LOGIN_COMMAND_TYPE => UserCommandKind::RecordLogin,
            DEACTIVATE_COMMAND_TYPE => UserCommandKind::Deactivate,
            ADD_ROLE_COMMAND_TYPE => UserCommandKind::AddRole(decode(&raw)?),
            _ => return Err(DomainError::UnknownCommand(raw.command_type)),
        };
        Ok(Self {
            command_id: raw.command_id,
            aggregate_id: raw.aggregate_id,
            metadata: raw.metadata,
            kind,
        })
    }
}
