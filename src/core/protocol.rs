//! Typed messages exchanged between a supervisor and its worker processes.
//!
//! One JSON document per line, internally tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{JobOutcome, ProviderError, RetryPolicy};

/// Supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Startup payload; resent verbatim after every respawn.
    Start {
        /// Opaque to the supervisor.
        payload: Value,
    },
    /// Finish in-flight work and exit cleanly.
    Exit,
}

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Periodic busy/idle report.
    State {
        /// The worker still sees pending work.
        processing: bool,
    },
    /// Outcome of one job attempt.
    Job(JobOutcome),
    /// Uncaught error; the worker exits right after sending it.
    Fault {
        /// Display form of the error.
        error: String,
    },
}

/// Startup payload the dispatcher hands to every worker of an account pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStartup {
    /// Access identifier of the account token.
    pub access_token: String,
    /// Account name, for logs.
    pub account_name: String,
    /// Durable queue holding the account's jobs.
    pub queue_name: String,
    /// Downstream API base URL.
    pub api_url: String,
    /// Jobs a worker runs at once.
    pub concurrency: usize,
    /// Sleep between queue polls when no job is ready, in milliseconds.
    pub idle_poll_ms: u64,
    /// Policy attached to task jobs created by update cycles.
    pub task_policy: RetryPolicy,
}

/// Serialize a message as one protocol line, newline included.
///
/// # Errors
///
/// `Protocol` if the message cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProviderError> {
    let mut line = serde_json::to_string(message).map_err(|e| ProviderError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line.
///
/// # Errors
///
/// `Protocol` if the line is not a valid message.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProviderError> {
    serde_json::from_str(line.trim()).map_err(|e| ProviderError::Protocol(e.to_string()))
}
