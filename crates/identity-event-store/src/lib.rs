//! Identity Event Store: `EventStore` implementations.
//!
//! `InMemoryEventStore` serves single-process deployments and tests;
//! `PgEventStore` persists to PostgreSQL.

pub mod memory_event_store;
pub mod pg_event_store;

pub use memory_event_store::InMemoryEventStore;
pub use pg_event_store::PgEventStore;
