//! CLI worker process spawning.

use std::process::Stdio;

use tokio::process::Command;

use super::proc::Proc;
use crate::error::{RelayError, Result};

/// How to launch one interactive CLI process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Executable name or path.
    pub program: String,
    /// Launch arguments.
    pub args: Vec<String>,
}

impl WorkerSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Spawn a CLI process with all three standard streams piped.
///
/// The child inherits the parent environment, so credentials configured for
/// the CLI (API keys, config directories) apply unchanged. The process is
/// killed if its handle is dropped without an orderly stop.
pub fn spawn_cli(spec: &WorkerSpec) -> Result<Proc> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| RelayError::ProcessLaunch {
        path: spec.program.clone(),
        source: e,
    })?;

    Proc::from_child(child)
}
