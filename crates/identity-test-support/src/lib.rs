//! Shared test doubles for the identity event-sourcing crates.

mod clock;
mod ids;
mod publisher;
mod store;

pub use clock::{FixedClock, SteppingClock};
pub use ids::SequentialIdGenerator;
pub use publisher::{FailingEventPublisher, FlakyEventPublisher, RecordingEventPublisher};
pub use store::FailingEventStore;
