//! Command handling for the User aggregate.
//!
//! Orchestrates domain logic: load the aggregate, run the behavior, persist
//! the produced events as one conditional append, then publish them.

use std::sync::Arc;
use std::time::Duration;

use identity_core::aggregate::{AggregateRoot, UncommittedEvents};
use identity_core::clock::Clock;
use identity_core::command::Command;
use identity_core::error::DomainError;
use identity_core::event::EventContext;
use identity_core::id::IdGenerator;
use identity_core::publisher::EventPublisher;
use identity_core::store::{EventStore, StoredEvent};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::application::query_handlers::{load_user, take_snapshot};
use crate::domain::aggregates::User;
use crate::domain::commands::{RawCommand, UserCommand, UserCommandKind};
use crate::domain::events::UserEvent;

/// Tuning knobs for [`CommandHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandlerConfig {
    /// Reload-and-retry attempts after a concurrency conflict.
    pub max_retries: u32,
    /// Snapshot whenever a commit crosses a multiple of this version; 0
    /// disables snapshotting.
    pub snapshot_interval: u32,
    /// Deadline for loading the user and running the behavior. The commit
    /// itself is never cut short, so a timeout always means nothing was
    /// written.
    pub command_timeout: Duration,
    /// Extra publish attempts per committed event after the first failure.
    pub publish_max_retries: u32,
    /// Delay before the first publish retry; doubled on each further retry.
    pub publish_backoff: Duration,
}

impl Default for CommandHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            snapshot_interval: 50,
            command_timeout: Duration::from_millis(5000),
            publish_max_retries: 3,
            publish_backoff: Duration::from_millis(50),
        }
    }
}

/// Result of a successfully handled command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    /// The user the command applied to.
    pub aggregate_id: Uuid,
    /// Version of the user after the command.
    pub version: i64,
    /// Events committed by the command, in version order. Empty for a no-op.
    pub events: Vec<StoredEvent>,
    /// Committed events the publisher still rejected after every retry.
    /// They remain in the store and can be redelivered from there.
    pub unpublished: Vec<Uuid>,
}

/// A behavior that ran against freshly loaded state, not yet persisted.
struct Prepared {
    user: User,
    pending: UncommittedEvents<UserEvent>,
}

/// State after one successful commit.
struct Committed {
    user: User,
    previous_version: i64,
    events: Vec<StoredEvent>,
}

/// Translates commands into User behaviors and persists their effects.
pub struct CommandHandler {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: CommandHandlerConfig,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Creates a handler with the default configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            ids,
            config: CommandHandlerConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CommandHandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &CommandHandlerConfig {
        &self.config
    }

    /// Converts an untyped command and handles it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownCommand` for an unrecognized command type,
    /// `DomainError::Validation` for a malformed payload, and anything
    /// [`CommandHandler::handle`] returns.
    pub async fn handle_raw(&self, raw: RawCommand) -> Result<CommandOutcome, DomainError> {
        let command = UserCommand::try_from(raw).inspect_err(|e| {
            warn!(error = %e, "rejected raw command");
        })?;
        self.handle(command).await
    }

    /// Handles one command end to end.
    ///
    /// Either every event the command produces is committed or none is.
    /// Publishing happens after the commit. Each event is retried with
    /// backoff; events that still fail are logged and listed in
    /// [`CommandOutcome::unpublished`], never returned as an error.
    ///
    /// # Errors
    ///
    /// Returns the behavior's rejection (`Validation`, `AlreadyExists`,
    /// `AggregateNotFound`), `ConcurrencyConflict` once retries are
    /// exhausted, `Timeout` if loading and executing outlast the deadline,
    /// or `Infrastructure` on store failure.
    pub async fn handle(&self, command: UserCommand) -> Result<CommandOutcome, DomainError> {
        let aggregate_id = self.resolve_aggregate_id(&command)?;
        let span = info_span!(
            "handle_command",
            command_id = %command.command_id,
            command_type = command.command_type(),
            aggregate_id = %aggregate_id,
            correlation_id = ?command.metadata.correlation_id,
        );
        async move {
            let committed = self.execute_with_retries(&command, aggregate_id).await?;

            let unpublished = self.publish(&committed.events).await;
            self.maybe_snapshot(&committed.user, committed.previous_version)
                .await;

            let version = committed.user.version();
            info!(
                version,
                events = committed.events.len(),
                unpublished = unpublished.len(),
                "command handled"
            );
            Ok::<_, DomainError>(CommandOutcome {
                aggregate_id,
                version,
                events: committed.events,
                unpublished,
            })
        }
        .instrument(span)
        .await
    }

    fn resolve_aggregate_id(&self, command: &UserCommand) -> Result<Uuid, DomainError> {
        match (command.aggregate_id, &command.kind) {
            (Some(id), _) => Ok(id),
            (None, UserCommandKind::CreateUser(_)) => Ok(self.ids.next_id()),
            (None, _) => Err(DomainError::Validation(format!(
                "{} requires an aggregate_id",
                command.command_type()
            ))),
        }
    }

    /// Runs load-execute-commit until it succeeds, fails for a reason other
    /// than a conflict, or runs out of retries.
    ///
    /// One deadline covers every load and execute. The conditional append
    /// runs outside it: once the store has been asked to write, the result
    /// is whatever the store reports.
    async fn execute_with_retries(
        &self,
        command: &UserCommand,
        aggregate_id: Uuid,
    ) -> Result<Committed, DomainError> {
        let timeout = self.config.command_timeout;
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            let Prepared { user, pending } =
                tokio::time::timeout_at(deadline, self.prepare(command, aggregate_id))
                    .await
                    .map_err(|_| {
                        warn!(?timeout, attempt, "command deadline elapsed before commit");
                        DomainError::Timeout(timeout)
                    })??;
            let previous_version = pending.expected_version();

            match pending.commit(self.store.as_ref()).await {
                Ok(events) => {
                    return Ok(Committed {
                        user,
                        previous_version,
                        events,
                    });
                }
                Err(DomainError::ConcurrencyConflict {
                    expected, actual, ..
                }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(expected, actual, attempt, "concurrency conflict; reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Loads the user and runs the command's behavior against it.
    async fn prepare(
        &self,
        command: &UserCommand,
        aggregate_id: Uuid,
    ) -> Result<Prepared, DomainError> {
        let mut user = load_user(self.store.as_ref(), aggregate_id).await?;
        let ctx = EventContext::new(self.clock.as_ref(), self.ids.as_ref())
            .with_user_id(command.metadata.user_id)
            .with_correlation_id(command.metadata.correlation_id)
            .with_causation_id(Some(command.command_id));
        let mut pending = UncommittedEvents::for_aggregate(&user);

        match &command.kind {
            UserCommandKind::CreateUser(create) => user.create_user(
                &create.email,
                &create.first_name,
                &create.last_name,
                &ctx,
                &mut pending,
            )?,
            UserCommandKind::VerifyEmail => user.verify_email(&ctx, &mut pending)?,
            UserCommandKind::UpdateProfile(update) => user.update_profile(
                update.first_name.as_deref(),
                update.last_name.as_deref(),
                &ctx,
                &mut pending,
            )?,
            UserCommandKind::RecordLogin => user.record_login(&ctx, &mut pending)?,
            UserCommandKind::Deactivate => user.deactivate(&ctx, &mut pending)?,
            UserCommandKind::AddRole(add) => user.add_role(&add.role, &ctx, &mut pending)?,
        }

        Ok(Prepared { user, pending })
    }

    /// Hands every committed event to the publisher in version order.
    /// Returns the ids of events that were still rejected after every retry.
    async fn publish(&self, events: &[StoredEvent]) -> Vec<Uuid> {
        let mut unpublished = Vec::new();
        for event in events {
            if let Err(e) = self.publish_with_retries(event).await {
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    version = event.sequence_number,
                    error = %e,
                    "failed to publish committed event"
                );
                unpublished.push(event.event_id);
            }
        }
        unpublished
    }

    async fn publish_with_retries(&self, event: &StoredEvent) -> Result<(), DomainError> {
        let mut backoff = self.config.publish_backoff;
        let mut attempt = 0;
        loop {
            match self.publisher.publish(event).await {
                Err(e) if attempt < self.config.publish_max_retries => {
                    attempt += 1;
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        ?backoff,
                        error = %e,
                        "publish failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    async fn maybe_snapshot(&self, user: &User, previous_version: i64) {
        let interval = i64::from(self.config.snapshot_interval);
        if interval == 0 || user.version() / interval == previous_version / interval {
            return;
        }
        if let Err(e) = take_snapshot(self.store.as_ref(), user, self.clock.as_ref()).await {
            warn!(version = user.version(), error = %e, "snapshot failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use identity_core::command::CommandMetadata;
    use identity_core::publisher::TracingEventPublisher;
    use identity_core::store::{EventFilter, Snapshot, StreamPosition};
    use identity_event_store::InMemoryEventStore;
    use identity_test_support::{
        FailingEventPublisher, FixedClock, FlakyEventPublisher, RecordingEventPublisher,
        SequentialIdGenerator,
    };
    use serde_json::json;

    use super::*;
    use crate::domain::commands::{AddRole, CreateUser};
    use crate::domain::events::{
        USER_CREATED_EVENT_TYPE, USER_EMAIL_VERIFIED_EVENT_TYPE, USER_ROLE_ADDED_EVENT_TYPE,
    };

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn handler_with(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> CommandHandler {
        CommandHandler::new(
            store,
            publisher,
            Arc::new(FixedClock(fixed_now())),
            Arc::new(SequentialIdGenerator::new(1)),
        )
    }

    fn command(aggregate_id: Option<Uuid>, kind: UserCommandKind) -> UserCommand {
        UserCommand {
            command_id: Uuid::new_v4(),
            aggregate_id,
            metadata: CommandMetadata {
                user_id: None,
                correlation_id: Some(Uuid::new_v4()),
                timestamp: fixed_now(),
            },
            kind,
        }
    }

    fn create(aggregate_id: Option<Uuid>) -> UserCommand {
        command(
            aggregate_id,
            UserCommandKind::CreateUser(CreateUser {
                email: "a@x.com".to_owned(),
                first_name: "A".to_owned(),
                last_name: "B".to_owned(),
            }),
        )
    }

    fn add_role(aggregate_id: Uuid, role: &str) -> UserCommand {
        command(
            Some(aggregate_id),
            UserCommandKind::AddRole(AddRole {
                role: role.to_owned(),
            }),
        )
    }

    /// Wraps an in-memory store, optionally delaying loads, delaying the
    /// acknowledgement of a successful append, or rejecting every append
    /// with a conflict.
    struct ScriptedStore {
        inner: InMemoryEventStore,
        load_delay: Option<Duration>,
        save_ack_delay: Option<Duration>,
        always_conflict: bool,
        save_attempts: AtomicU32,
    }

    impl ScriptedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                load_delay: None,
                save_ack_delay: None,
                always_conflict: false,
                save_attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventStore for ScriptedStore {
        async fn save_events(
            &self,
            aggregate_id: Uuid,
            expected_version: i64,
            events: &[StoredEvent],
        ) -> Result<(), DomainError> {
            self.save_attempts.fetch_add(1, Ordering::SeqCst);
            if self.always_conflict {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            self.inner
                .save_events(aggregate_id, expected_version, events)
                .await?;
            if let Some(delay) = self.save_ack_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn get_events(
            &self,
            aggregate_id: Uuid,
            from_version: Option<i64>,
        ) -> Result<Vec<StoredEvent>, DomainError> {
            if let Some(delay) = self.load_delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.get_events(aggregate_id, from_version).await
        }

        async fn get_events_as_of(
            &self,
            aggregate_id: Uuid,
            as_of: DateTime<Utc>,
        ) -> Result<Vec<StoredEvent>, DomainError> {
            self.inner.get_events_as_of(aggregate_id, as_of).await
        }

        async fn get_aggregate_version(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
            self.inner.get_aggregate_version(aggregate_id).await
        }

        async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
            self.inner.save_snapshot(snapshot).await
        }

        async fn get_latest_snapshot(
            &self,
            aggregate_id: Uuid,
        ) -> Result<Option<Snapshot>, DomainError> {
            self.inner.get_latest_snapshot(aggregate_id).await
        }

        async fn read_page(
            &self,
            filter: &EventFilter,
            after: Option<StreamPosition>,
            limit: usize,
        ) -> Result<Vec<StoredEvent>, DomainError> {
            self.inner.read_page(filter, after, limit).await
        }

        async fn stream_position(
            &self,
            event_id: Uuid,
        ) -> Result<Option<StreamPosition>, DomainError> {
            self.inner.stream_position(event_id).await
        }
    }

    #[tokio::test]
    async fn test_scenario_a_repeated_role_grant_adds_no_event() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let publisher = Arc::new(RecordingEventPublisher::new());
        let handler = handler_with(store.clone(), publisher.clone());
        let user_id = Uuid::new_v4();

        // Act
        handler.handle(create(Some(user_id))).await.unwrap();
        handler
            .handle(command(Some(user_id), UserCommandKind::VerifyEmail))
            .await
            .unwrap();
        handler.handle(add_role(user_id, "admin")).await.unwrap();
        let repeat = handler.handle(add_role(user_id, "admin")).await.unwrap();

        // Assert
        assert!(repeat.events.is_empty());
        assert_eq!(repeat.version, 3);

        let stored = store.get_events(user_id, None).await.unwrap();
        let types: Vec<&str> = stored.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                USER_CREATED_EVENT_TYPE,
                USER_EMAIL_VERIFIED_EVENT_TYPE,
                USER_ROLE_ADDED_EVENT_TYPE
            ]
        );
        assert_eq!(publisher.published_events(), stored);

        let user = load_user(store.as_ref(), user_id).await.unwrap();
        assert_eq!(user.email(), "a@x.com");
        assert_eq!(user.first_name(), "A");
        assert_eq!(user.last_name(), "B");
        assert!(user.is_active());
        assert!(user.email_verified());
        assert_eq!(user.roles(), ["admin".to_owned()]);
        assert_eq!(user.version(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_b_concurrent_creates_admit_exactly_one() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let handler = Arc::new(handler_with(
            store.clone(),
            Arc::new(TracingEventPublisher),
        ));
        let user_id = Uuid::new_v4();

        // Act
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(create(Some(user_id))).await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        // Assert
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for result in &results {
            if let Err(e) = result {
                assert!(
                    matches!(
                        e,
                        DomainError::AlreadyExists(_) | DomainError::ConcurrencyConflict { .. }
                    ),
                    "unexpected error: {e:?}"
                );
            }
        }
        let stored = store.get_events(user_id, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, USER_CREATED_EVENT_TYPE);
    }

    #[tokio::test]
    async fn test_scenario_c_unknown_command_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher));
        let raw = RawCommand {
            command_id: Uuid::new_v4(),
            command_type: "DeleteUniverse".to_owned(),
            aggregate_id: Some(Uuid::new_v4()),
            payload: json!({}),
            metadata: CommandMetadata {
                user_id: None,
                correlation_id: None,
                timestamp: fixed_now(),
            },
        };

        let result = handler.handle_raw(raw).await;

        match result {
            Err(DomainError::UnknownCommand(tag)) => assert_eq!(tag, "DeleteUniverse"),
            other => panic!("expected UnknownCommand, got {other:?}"),
        }
        let all = store.get_all_events(&EventFilter::default()).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_handle_raw_create_user_commits_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher));
        let user_id = Uuid::new_v4();
        let raw = RawCommand {
            command_id: Uuid::new_v4(),
            command_type: "CreateUser".to_owned(),
            aggregate_id: Some(user_id),
            payload: json!({"email": "a@x.com", "first_name": "A", "last_name": "B"}),
            metadata: CommandMetadata {
                user_id: None,
                correlation_id: None,
                timestamp: fixed_now(),
            },
        };

        let outcome = handler.handle_raw(raw).await.unwrap();

        assert_eq!(outcome.aggregate_id, user_id);
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test]
    async fn test_create_without_id_generates_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher));

        let outcome = handler.handle(create(None)).await.unwrap();

        assert_eq!(outcome.aggregate_id, Uuid::from_u128(1));
        assert_eq!(outcome.events[0].aggregate_id, Uuid::from_u128(1));
        assert_eq!(outcome.events[0].event_id, Uuid::from_u128(2));
        assert_eq!(store.get_aggregate_version(Uuid::from_u128(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_create_command_without_id_is_rejected() {
        let handler = handler_with(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(TracingEventPublisher),
        );

        let result = handler
            .handle(command(None, UserCommandKind::Deactivate))
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_command_on_missing_user_returns_not_found() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher));
        let user_id = Uuid::new_v4();

        let result = handler
            .handle(command(Some(user_id), UserCommandKind::VerifyEmail))
            .await;

        match result {
            Err(DomainError::AggregateNotFound(id)) => assert_eq!(id, user_id),
            other => panic!("expected AggregateNotFound, got {other:?}"),
        }
        assert_eq!(store.get_aggregate_version(user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_events_carry_command_metadata() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher));
        let mut create = create(Some(Uuid::new_v4()));
        create.metadata.user_id = Some(Uuid::new_v4());

        let outcome = handler.handle(create.clone()).await.unwrap();

        let event = &outcome.events[0];
        assert_eq!(event.causation_id, Some(create.command_id));
        assert_eq!(event.correlation_id, create.metadata.correlation_id);
        assert_eq!(event.user_id, create.metadata.user_id);
        assert_eq!(event.occurred_at, fixed_now());
    }

    fn fast_publish_retries() -> CommandHandlerConfig {
        CommandHandlerConfig {
            publish_max_retries: 2,
            publish_backoff: Duration::from_millis(1),
            ..CommandHandlerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publisher_failure_does_not_undo_commit() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(FailingEventPublisher))
            .with_config(fast_publish_retries());
        let user_id = Uuid::new_v4();

        let outcome = handler.handle(create(Some(user_id))).await.unwrap();

        assert_eq!(outcome.unpublished, vec![outcome.events[0].event_id]);
        assert_eq!(store.get_aggregate_version(user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_publisher_failure_is_retried_until_delivered() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let publisher = Arc::new(FlakyEventPublisher::new(1));
        let handler =
            handler_with(store.clone(), publisher.clone()).with_config(fast_publish_retries());
        let user_id = Uuid::new_v4();

        // Act
        let created = handler.handle(create(Some(user_id))).await.unwrap();
        handler
            .handle(command(Some(user_id), UserCommandKind::VerifyEmail))
            .await
            .unwrap();
        handler
            .handle(command(Some(user_id), UserCommandKind::RecordLogin))
            .await
            .unwrap();

        // Assert
        assert!(created.unpublished.is_empty());
        assert_eq!(publisher.attempts(), 4);
        let stored = store.get_events(user_id, None).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(publisher.published_events(), stored);
    }

    #[tokio::test]
    async fn test_commit_acknowledged_after_deadline_is_not_a_timeout() {
        let store = Arc::new(ScriptedStore {
            save_ack_delay: Some(Duration::from_millis(200)),
            ..ScriptedStore::new()
        });
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher))
            .with_config(CommandHandlerConfig {
                command_timeout: Duration::from_millis(50),
                ..CommandHandlerConfig::default()
            });
        let user_id = Uuid::new_v4();

        let outcome = handler.handle(create(Some(user_id))).await.unwrap();

        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(store.save_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.get_aggregate_version(user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_taken_when_commit_crosses_interval() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher))
            .with_config(CommandHandlerConfig {
                snapshot_interval: 2,
                ..CommandHandlerConfig::default()
            });
        let user_id = Uuid::new_v4();

        // Act
        handler.handle(create(Some(user_id))).await.unwrap();
        let after_first = store.get_latest_snapshot(user_id).await.unwrap();
        handler
            .handle(command(Some(user_id), UserCommandKind::VerifyEmail))
            .await
            .unwrap();
        handler.handle(add_role(user_id, "admin")).await.unwrap();

        // Assert
        assert!(after_first.is_none());
        let snapshot = store.get_latest_snapshot(user_id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
        let user = load_user(store.as_ref(), user_id).await.unwrap();
        assert_eq!(user.version(), 3);
        assert_eq!(user.roles(), ["admin".to_owned()]);
    }

    #[tokio::test]
    async fn test_zero_snapshot_interval_disables_snapshots() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher))
            .with_config(CommandHandlerConfig {
                snapshot_interval: 0,
                ..CommandHandlerConfig::default()
            });
        let user_id = Uuid::new_v4();

        handler.handle(create(Some(user_id))).await.unwrap();

        assert!(store.get_latest_snapshot(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let store = Arc::new(ScriptedStore {
            always_conflict: true,
            ..ScriptedStore::new()
        });
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher))
            .with_config(CommandHandlerConfig {
                max_retries: 2,
                ..CommandHandlerConfig::default()
            });

        let result = handler.handle(create(Some(Uuid::new_v4()))).await;

        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.save_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_without_committing() {
        let store = Arc::new(ScriptedStore {
            load_delay: Some(Duration::from_millis(500)),
            ..ScriptedStore::new()
        });
        let handler = handler_with(store.clone(), Arc::new(TracingEventPublisher))
            .with_config(CommandHandlerConfig {
                command_timeout: Duration::from_millis(20),
                ..CommandHandlerConfig::default()
            });
        let user_id = Uuid::new_v4();

        let result = handler.handle(create(Some(user_id))).await;

        match result {
            Err(e @ DomainError::Timeout(_)) => assert!(e.is_retriable()),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(store.save_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(store.inner.get_aggregate_version(user_id).await.unwrap(), 0);
    }
}
