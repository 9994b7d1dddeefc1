//! Runtime configuration assembled from command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::chunker::DEFAULT_MAX_CHUNK_CHARS;
use crate::oneshot::{FALLBACK_MODEL, OneShotRunner};
use crate::session::SessionConfig;
use crate::worker::{WorkerPoolConfig, WorkerSpec};

/// Model name clients may use to mean "whatever the backend defaults to".
pub const MODEL_ALIAS: &str = "clirelay";

/// How requests reach the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Long-lived interactive processes, one request per process at a time.
    #[default]
    Pooled,
    /// A fresh `-m MODEL -p PROMPT` process per request.
    Oneshot,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled => f.write_str("pooled"),
            Self::Oneshot => f.write_str("oneshot"),
        }
    }
}

/// Everything needed to build a backend.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// CLI executable name or path.
    pub cli_path: String,
    /// Extra arguments for every CLI launch.
    pub cli_args: Vec<String>,
    pub mode: BackendMode,
    /// Number of pooled workers.
    pub pool_size: usize,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Maximum wait for an idle worker.
    pub acquire_timeout: Duration,
    pub reset_command: Option<String>,
    pub stats_command: Option<String>,
    /// Model used when a request names none or names [`MODEL_ALIAS`].
    pub default_model: String,
    /// Replace dead pooled workers.
    pub respawn: bool,
    /// Chunk size limit for streamed text without boundaries.
    pub chunk_chars: usize,
    /// Directory for request dumps, `None` when dumping is off.
    pub debug_dump_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cli_path: "gemini".to_string(),
            cli_args: Vec::new(),
            mode: BackendMode::default(),
            pool_size: 2,
            command_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(30),
            reset_command: Some("/clear".to_string()),
            stats_command: None,
            default_model: FALLBACK_MODEL.to_string(),
            respawn: true,
            chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            debug_dump_dir: None,
        }
    }
}

impl RelayConfig {
    /// Resolve a requested model name against the alias and the default.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            None | Some("") => self.default_model.clone(),
            Some(model) if model == MODEL_ALIAS => self.default_model.clone(),
            Some(model) => model.to_string(),
        }
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec::new(&self.cli_path).with_args(self.cli_args.iter().cloned())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size: self.pool_size,
            spec: self.worker_spec(),
            acquire_timeout: self.acquire_timeout,
            respawn: self.respawn,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command_timeout: self.command_timeout,
            reset_command: self.reset_command.clone(),
            stats_command: self.stats_command.clone(),
            chunk_chars: self.chunk_chars,
        }
    }

    pub fn oneshot_runner(&self) -> OneShotRunner {
        OneShotRunner::new(&self.cli_path, self.command_timeout)
            .with_args(self.cli_args.clone())
            .with_chunk_chars(self.chunk_chars)
            .with_fallback_model(&self.default_model)
    }
}
