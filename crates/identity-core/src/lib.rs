//! Identity Core: shared event-sourcing abstractions.
//!
//! This crate defines the fundamental traits and types that the identity
//! aggregates and event store implementations depend on. It contains no
//! infrastructure code.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod fold;
pub mod id;
pub mod publisher;
pub mod store;
