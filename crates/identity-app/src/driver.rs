//! Newline-delimited JSON command driver.
//!
//! Each input line is one [`RawCommand`]; each handled line produces exactly
//! one result line on the output.

use identity_core::error::DomainError;
use identity_core::store::StoredEvent;
use identity_user::application::command_handlers::{CommandHandler, CommandOutcome};
use identity_user::domain::commands::RawCommand;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;

/// Result line written for one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    /// The command was committed (possibly as a no-op).
    Accepted {
        /// Always `true`.
        ok: bool,
        /// The user the command applied to.
        aggregate_id: Uuid,
        /// Version after the command.
        version: i64,
        /// Committed events.
        events: Vec<StoredEvent>,
        /// Ids of committed events the publisher never accepted.
        unpublished: Vec<Uuid>,
    },
    /// The command was rejected or failed; nothing was committed.
    Rejected {
        /// Always `false`.
        ok: bool,
        /// Machine-readable error code.
        error: &'static str,
        /// Human-readable error message.
        message: String,
        /// Whether resubmitting may succeed.
        retriable: bool,
    },
}

impl From<CommandOutcome> for CommandResult {
    fn from(outcome: CommandOutcome) -> Self {
        Self::Accepted {
            ok: true,
            aggregate_id: outcome.aggregate_id,
            version: outcome.version,
            events: outcome.events,
            unpublished: outcome.unpublished,
        }
    }
}

impl From<&DomainError> for CommandResult {
    fn from(err: &DomainError) -> Self {
        Self::Rejected {
            ok: false,
            error: err.code(),
            message: err.to_string(),
            retriable: err.is_retriable(),
        }
    }
}

/// Counters reported when the input is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Commands that were committed.
    pub accepted: usize,
    /// Commands that were rejected or failed, including unparseable lines.
    pub rejected: usize,
}

/// Handles a single input line. Returns `None` for a blank line.
pub async fn process_line(handler: &CommandHandler, line: &str) -> Option<CommandResult> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawCommand = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "unparseable command line");
            return Some(CommandResult::Rejected {
                ok: false,
                error: "invalid_json",
                message: format!("invalid command: {e}"),
                retriable: false,
            });
        }
    };
    Some(match handler.handle_raw(raw).await {
        Ok(outcome) => CommandResult::from(outcome),
        Err(e) => CommandResult::from(&e),
    })
}

/// Reads commands from `input` until end of file, writing one result line
/// per command to `output`.
///
/// # Errors
///
/// Returns `AppError::Io` if reading or writing fails. Command failures are
/// reported on `output`, never returned.
pub async fn run<R, W>(
    handler: &CommandHandler,
    input: R,
    mut output: W,
) -> Result<DriverStats, AppError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = DriverStats::default();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let Some(result) = process_line(handler, &line).await else {
            continue;
        };
        match result {
            CommandResult::Accepted { .. } => stats.accepted += 1,
            CommandResult::Rejected { .. } => stats.rejected += 1,
        }
        let mut encoded = serde_json::to_vec(&result).map_err(std::io::Error::other)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        "input exhausted"
    );
    Ok(stats)
}
