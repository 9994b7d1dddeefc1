//! Process handle for CLI worker subprocesses.
//!
//! Wraps a tokio child with buffered stdout, a writable stdin and a
//! background task that drains stderr into a channel so the child never
//! blocks on a full stderr pipe.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::chunker::Utf8Decoder;
use crate::error::{RelayError, Result};

/// Read size for the stderr pump.
const STDERR_READ_SIZE: usize = 4096;

/// Handle to a running CLI process.
pub struct Proc {
    child: Child,
    pid: Option<Pid>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr_rx: mpsc::UnboundedReceiver<String>,
    exit: Option<ExitStatus>,
}

impl Proc {
    /// Create from a spawned child with piped stdio.
    ///
    /// Must be called inside a tokio runtime: the stderr pump is a task.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr not captured"))?;

        let (tx, stderr_rx) = mpsc::unbounded_channel();
        pump_stderr(stderr, tx);

        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr_rx,
            exit: None,
        })
    }

    /// Get the process ID, if the process has not been reaped.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Write `data` to stdin and flush.
    pub async fn write(&mut self, data: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await
    }

    /// Read one stdout line, without its terminator.
    ///
    /// Returns `None` on EOF. Invalid UTF-8 is replaced rather than rejected.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut raw = Vec::new();
        if self.stdout.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Read whatever stdout bytes are available. Returns 0 on EOF.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    /// Collect stderr received so far without waiting.
    pub fn drain_stderr(&mut self) -> String {
        let mut out = String::new();
        while let Ok(text) = self.stderr_rx.try_recv() {
            out.push_str(&text);
        }
        out
    }

    /// Collect stderr for up to `window`, stopping early if the stream closes.
    pub async fn drain_stderr_for(&mut self, window: Duration) -> String {
        let deadline = Instant::now() + window;
        let mut out = self.drain_stderr();
        while let Ok(Some(text)) = tokio::time::timeout_at(deadline, self.stderr_rx.recv()).await {
            out.push_str(&text);
        }
        out
    }

    /// Non-blocking exit check. The status is cached once observed.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().ok().flatten();
        }
        self.exit
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Wait up to `window` for the process to exit.
    pub async fn wait_for(&mut self, window: Duration) -> Option<ExitStatus> {
        if self.exit.is_none()
            && let Ok(Ok(status)) = tokio::time::timeout(window, self.child.wait()).await
        {
            self.exit = Some(status);
        }
        self.exit
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => signal::kill(pid, Signal::SIGTERM).map_err(|e| RelayError::Io(e.into())),
            None => Ok(()),
        }
    }

    /// Gracefully stop the process: close stdin, SIGTERM, wait, then SIGKILL.
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_wait() {
            return Some(status);
        }

        // EOF alone is enough for most REPLs.
        drop(self.stdin.take());
        if let Err(e) = self.terminate() {
            debug!(pid = ?self.pid, error = %e, "SIGTERM failed");
        }

        if let Some(status) = self.wait_for(grace).await {
            return Some(status);
        }

        debug!(pid = ?self.pid, "process ignored SIGTERM, sending SIGKILL");
        if let Err(e) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %e, "SIGKILL failed");
        }
        self.try_wait()
    }
}

/// Forward stderr text to `tx` until EOF or the receiver goes away.
fn pump_stderr(mut stderr: ChildStderr, tx: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        let mut buf = [0u8; STDERR_READ_SIZE];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    trace!(bytes = n, "stderr");
                    if !text.is_empty() && tx.send(text).is_err() {
                        return;
                    }
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(rest);
        }
    });
}
