//! Test id generator: predictable identifiers for tests.

use std::sync::Mutex;

use identity_core::id::IdGenerator;
use uuid::Uuid;

/// Hands out `Uuid::from_u128(start)`, `start + 1`, ... in call order.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: Mutex<u128>,
}

impl SequentialIdGenerator {
    /// Create a generator whose first id is `Uuid::from_u128(start)`.
    #[must_use]
    pub fn new(start: u128) -> Self {
        Self {
            next: Mutex::new(start),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> Uuid {
        let mut next = self.next.lock().unwrap();
        let id = Uuid::from_u128(*next);
        *next += 1;
        id
    }
}
