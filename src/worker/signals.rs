//! Termination analysis for CLI worker processes.
//!
//! Turns an exit status into something worth putting in a log line or an
//! error message when a worker dies mid-conversation.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Terminated on request (SIGTERM or SIGINT).
    Terminated(Signal),
    /// SIGKILL, from us or the OOM killer.
    Killed,
    /// Crashed (SIGSEGV, SIGBUS, SIGABRT).
    Crashed(Signal),
    /// Killed by some other signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Terminated(sig) => format!("terminated by {:?}", sig),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an optional exit status; `None` means the process has not exited.
pub fn analyze_exit_status(status: Option<ExitStatus>) -> TerminationReason {
    let Some(status) = status else {
        return TerminationReason::StillAlive;
    };

    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) => TerminationReason::Killed,
        Some(Ok(sig @ (Signal::SIGTERM | Signal::SIGINT))) => TerminationReason::Terminated(sig),
        Some(Ok(sig @ (Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT))) => {
            TerminationReason::Crashed(sig)
        }
        Some(Ok(sig)) => TerminationReason::Signaled(sig),
        _ => TerminationReason::Unknown,
    }
}
