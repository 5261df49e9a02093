//! Identifier generation abstraction for determinism.
//!
//! Event ids and generated aggregate ids flow through this trait so tests
//! and replays can inject a predictable sequence.

use uuid::Uuid;

/// Abstraction over identifier generation.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh, globally unique identifier.
    fn next_id(&self) -> Uuid;
}

/// Production generator producing time-ordered UUIDv7 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}
