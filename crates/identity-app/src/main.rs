//! Identity command driver entry point.
//!
//! Reads JSON commands from stdin, one per line, and writes one JSON result
//! per command to stdout. Logs go to stderr.

use std::error::Error;
use std::sync::Arc;

use identity_app::config::AppConfig;
use identity_app::driver;
use identity_core::clock::SystemClock;
use identity_core::id::UuidV7Generator;
use identity_core::publisher::TracingEventPublisher;
use identity_core::store::EventStore;
use identity_event_store::{InMemoryEventStore, PgEventStore};
use identity_user::application::command_handlers::CommandHandler;
use sqlx::postgres::PgPoolOptions;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    tracing::info!("Starting identity command driver");

    let config = AppConfig::from_env()?;

    let store: Arc<dyn EventStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await?;
            let store = PgEventStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("Using PostgreSQL event store");
            Arc::new(store)
        }
        None => {
            tracing::info!("DATABASE_URL not set; using in-memory event store");
            Arc::new(InMemoryEventStore::new())
        }
    };

    let handler = CommandHandler::new(
        store,
        Arc::new(TracingEventPublisher),
        Arc::new(SystemClock),
        Arc::new(UuidV7Generator),
    )
    .with_config(config.handler);

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    driver::run(&handler, stdin, stdout).await?;

    Ok(())
}
