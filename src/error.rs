//! Error types for clirelay.

use std::time::Duration;

use thiserror::Error;

/// Main error type for clirelay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to launch '{path}': {source}")]
    ProcessLaunch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No CLI workers could be started ({attempted} attempted). Check the CLI installation and PATH.")]
    PoolInitialization { attempted: usize },

    #[error("Command timed out after {} seconds", .0.as_secs_f64())]
    CommandTimeout(Duration),

    #[error("Worker {worker} closed its output before the command completed ({reason}){}", stderr_suffix(.stderr))]
    ProtocolViolation {
        worker: usize,
        reason: String,
        stderr: String,
    },

    #[error("Could not parse CLI output: {0}")]
    OutputParse(String),

    #[error("No worker became available within {} seconds", .0.as_secs_f64())]
    AcquireTimeout(Duration),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("CLI exited with code {code}: {stderr}")]
    CliFailed { code: i32, stderr: String },

    #[error("No user message found in request")]
    EmptyPrompt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

impl RelayError {
    /// Whether the failure is a timeout of the command itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout(_))
    }

    /// Whether the failure means the worker's process can no longer be used.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. } | Self::PoolShutdown)
    }
}

/// Result type alias for clirelay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
