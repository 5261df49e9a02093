//! Domain model for the User aggregate.

pub mod aggregates;
pub mod commands;
pub mod events;
