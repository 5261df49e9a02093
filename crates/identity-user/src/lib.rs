//! Identity: User aggregate.
//!
//! Responsible for user registration, email verification, profile changes,
//! logins, roles, and deactivation, all recorded as events.

pub mod application;
pub mod domain;
