//! Test publishers: mock `EventPublisher` implementations for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use identity_core::error::DomainError;
use identity_core::publisher::EventPublisher;
use identity_core::store::StoredEvent;

/// A publisher that records every event it receives and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    published: Mutex<Vec<StoredEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recording publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all events that were published, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published_events(&self) -> Vec<StoredEvent> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: &StoredEvent) -> Result<(), DomainError> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A publisher that always returns an infrastructure error. Useful for
/// checking that delivery failures never undo a committed command.
#[derive(Debug)]
pub struct FailingEventPublisher;

#[async_trait]
impl EventPublisher for FailingEventPublisher {
    async fn publish(&self, _event: &StoredEvent) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("broker unavailable".into()))
    }
}

/// A publisher that rejects its first `failures` calls, then records every
/// event like [`RecordingEventPublisher`].
#[derive(Debug)]
pub struct FlakyEventPublisher {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    delivered: RecordingEventPublisher,
}

impl FlakyEventPublisher {
    /// Create a publisher that fails `failures` times before recovering.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            delivered: RecordingEventPublisher::new(),
        }
    }

    /// Returns every publish call made so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the events that were accepted, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published_events(&self) -> Vec<StoredEvent> {
        self.delivered.published_events()
    }
}

#[async_trait]
impl EventPublisher for FlakyEventPublisher {
    async fn publish(&self, event: &StoredEvent) -> Result<(), DomainError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DomainError::Infrastructure("broker unavailable".into()));
        }
        self.delivered.publish(event).await
    }
}
