//! Environment configuration.

use std::str::FromStr;
use std::time::Duration;

use identity_user::application::command_handlers::CommandHandlerConfig;

use crate::error::AppError;

/// Settings read from the process environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// PostgreSQL URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Connection pool size.
    pub database_max_connections: u32,
    /// Command handler tuning.
    pub handler: CommandHandlerConfig,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a
    /// variable or `None` when it is unset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = CommandHandlerConfig::default();
        let timeout_ms: u64 = parse_or(&lookup, "COMMAND_TIMEOUT_MS", 5000)?;
        if timeout_ms == 0 {
            return Err(AppError::Config(
                "COMMAND_TIMEOUT_MS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            handler: CommandHandlerConfig {
                max_retries: parse_or(&lookup, "COMMAND_MAX_RETRIES", defaults.max_retries)?,
                snapshot_interval: parse_or(
                    &lookup,
                    "SNAPSHOT_INTERVAL",
                    defaults.snapshot_interval,
                )?,
                command_timeout: Duration::from_millis(timeout_ms),
                publish_max_retries: parse_or(
                    &lookup,
                    "PUBLISH_MAX_RETRIES",
                    defaults.publish_max_retries,
                )?,
                publish_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "PUBLISH_BACKOFF_MS",
                    50,
                )?),
            },
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key} must be a valid number: {e}"))),
        None => Ok(default),
    }
}
