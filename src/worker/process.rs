//! A single long-lived interactive CLI process.
//!
//! A [`Worker`] owns one child process and runs commands against it one at
//! a time. Each command is written to stdin followed by a marker line; the
//! command is complete when the marker comes back on stdout.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::proc::Proc;
use super::protocol::{CommandOutput, Delimiter, LineKind, OutputFragment, StreamFramer};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::{WorkerSpec, spawn_cli};
use crate::chunker::Utf8Decoder;
use crate::error::{RelayError, Result};

/// Grace period between SIGTERM and SIGKILL when stopping.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long to collect stderr after a command times out.
pub const STDERR_DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// How long to wait for an exit status after stdout closes.
const EXIT_PROBE_WINDOW: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 4096;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Idle,
    Busy,
    Terminating,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

/// One interactive CLI process plus its framing state.
pub struct Worker {
    /// Worker ID for logging.
    id: usize,
    /// Launch configuration, reused on restart.
    spec: WorkerSpec,
    state: WorkerState,
    /// Process handle (None until started, and after stop).
    proc: Option<Proc>,
    /// Marker token for the current process instance.
    delimiter: Delimiter,
    /// Sequence number for the next command.
    next_seq: u64,
    /// Number of commands completed by this worker.
    commands_completed: usize,
    /// Number of times this worker has been restarted.
    restarts: usize,
    /// Command whose framed text was written and whose marker is still due.
    in_flight: Option<u64>,
    /// A command given up on before its marker came back.
    abandoned: Option<u64>,
}

impl Worker {
    /// Create a stopped worker. Call [`Worker::start`] before use.
    pub fn new(id: usize, spec: WorkerSpec) -> Self {
        Self {
            id,
            spec,
            state: WorkerState::Stopped,
            proc: None,
            delimiter: Delimiter::generate(),
            next_seq: 1,
            commands_completed: 0,
            restarts: 0,
            in_flight: None,
            abandoned: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn commands_completed(&self) -> usize {
        self.commands_completed
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Process ID of the running child, if any.
    pub fn pid(&self) -> Option<nix::unistd::Pid> {
        self.proc.as_ref().and_then(Proc::pid)
    }

    /// Whether the child process exists and has not exited.
    pub fn is_alive(&mut self) -> bool {
        self.proc.as_mut().is_some_and(Proc::is_running)
    }

    /// Whether the worker can accept a command right now.
    pub fn is_ready(&mut self) -> bool {
        self.state == WorkerState::Idle && self.is_alive()
    }

    /// Why the process ended, if it has.
    pub fn termination_reason(&mut self) -> TerminationReason {
        match self.proc.as_mut() {
            Some(proc) => analyze_exit_status(proc.try_wait()),
            None => TerminationReason::Unknown,
        }
    }

    /// Spawn the CLI process. No-op if it is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }

        self.state = WorkerState::Starting;
        let proc = match spawn_cli(&self.spec) {
            Ok(proc) => proc,
            Err(e) => {
                self.state = WorkerState::Stopped;
                return Err(e);
            }
        };

        info!(
            worker_id = self.id,
            pid = ?proc.pid(),
            program = %self.spec.program,
            "CLI worker started"
        );

        self.proc = Some(proc);
        self.delimiter = Delimiter::generate();
        self.next_seq = 1;
        self.in_flight = None;
        self.abandoned = None;
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// Stop the process: SIGTERM, then SIGKILL after [`STOP_GRACE`].
    ///
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut proc) = self.proc.take() else {
            self.state = WorkerState::Stopped;
            return;
        };

        self.state = WorkerState::Terminating;
        let status = proc.stop(STOP_GRACE).await;
        debug!(
            worker_id = self.id,
            reason = %analyze_exit_status(status),
            "CLI worker stopped"
        );
        self.state = WorkerState::Stopped;
    }

    /// Stop and start again with a fresh delimiter.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await;
        self.restarts += 1;
        self.start().await
    }

    /// Run one command and collect its complete output.
    ///
    /// On timeout the process is left running. The next command first reads
    /// and drops the late output, up to this command's marker.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let seq = self.begin_command()?;
        let started = Instant::now();
        let deadline = started + timeout;
        let result = match self.skip_abandoned(deadline, timeout).await {
            Ok(()) => self.run_command(command, seq, deadline, timeout).await,
            Err(e) => Err(e),
        };
        self.end_command(result.is_ok());

        debug!(
            worker_id = self.id,
            seq,
            elapsed_ms = started.elapsed().as_millis(),
            ok = result.is_ok(),
            "command finished"
        );
        result
    }

    /// Run one command and read its output incrementally.
    ///
    /// The returned stream borrows the worker; dropping it early leaves the
    /// worker usable.
    pub async fn execute_stream(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandStream<'_>> {
        let seq = self.begin_command()?;
        let deadline = Instant::now() + timeout;
        if let Err(e) = self.skip_abandoned(deadline, timeout).await {
            self.end_command(false);
            return Err(e);
        }
        let id = self.id;
        let state = self.state;
        let framed = self.delimiter.frame_command(command, seq);

        self.in_flight = Some(seq);
        let sent = match self.proc.as_mut() {
            None => Err(not_running(id, state)),
            Some(proc) => match tokio::time::timeout_at(deadline, proc.write(&framed)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(death_report(id, proc, format!("stdin write failed: {}", e)).await),
                Err(_) => Err(RelayError::CommandTimeout(timeout)),
            },
        };
        if let Err(e) = sent {
            self.end_command(false);
            return Err(e);
        }

        let framer = self.delimiter.stream_framer(seq);
        Ok(CommandStream {
            worker: self,
            framer,
            decoder: Utf8Decoder::new(),
            deadline,
            timeout,
            done: false,
        })
    }

    /// Put a worker whose command was abandoned mid-flight back in a usable state.
    pub fn recover(&mut self) {
        if self.state == WorkerState::Busy {
            debug!(worker_id = self.id, "recovering worker from abandoned command");
            self.end_command(false);
        }
    }

    fn begin_command(&mut self) -> Result<u64> {
        if self.state != WorkerState::Idle || self.proc.is_none() {
            return Err(not_running(self.id, self.state));
        }
        self.state = WorkerState::Busy;
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    fn end_command(&mut self, succeeded: bool) {
        if let Some(seq) = self.in_flight.take()
            && !succeeded
        {
            self.abandoned = Some(seq);
        }
        if succeeded {
            self.commands_completed += 1;
        }
        self.state = if self.is_alive() {
            WorkerState::Idle
        } else {
            WorkerState::Stopped
        };
    }

    /// Read and drop output of an abandoned command, up to its marker.
    ///
    /// Earlier markers met on the way are dropped too. If `deadline` passes
    /// first the command is still owed and the next one tries again.
    async fn skip_abandoned(&mut self, deadline: Instant, timeout: Duration) -> Result<()> {
        let Some(stale) = self.abandoned else {
            return Ok(());
        };
        let id = self.id;
        let state = self.state;
        let delimiter = &self.delimiter;
        let Some(proc) = self.proc.as_mut() else {
            return Err(not_running(id, state));
        };

        let skip = async {
            let mut dropped = 0usize;
            while let Some(line) = proc.read_line().await? {
                if let LineKind::End { .. } = delimiter.scan_line(&line, stale) {
                    return Ok(Some(dropped));
                }
                dropped += 1;
            }
            Ok::<_, std::io::Error>(None)
        };

        match tokio::time::timeout_at(deadline, skip).await {
            Ok(Ok(Some(dropped))) => {
                debug!(
                    worker_id = id,
                    seq = stale,
                    dropped_lines = dropped,
                    "discarded late output of abandoned command"
                );
                self.abandoned = None;
                Ok(())
            }
            Ok(Ok(None)) => Err(death_report(id, proc, "stdout closed".to_string()).await),
            Ok(Err(e)) => Err(death_report(id, proc, format!("I/O error: {}", e)).await),
            Err(_) => {
                warn!(
                    worker_id = id,
                    seq = stale,
                    "abandoned command still running, no time left for the next one"
                );
                Err(RelayError::CommandTimeout(timeout))
            }
        }
    }

    async fn run_command(
        &mut self,
        command: &str,
        seq: u64,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let id = self.id;
        let state = self.state;
        let framed = self.delimiter.frame_command(command, seq);
        self.in_flight = Some(seq);
        let delimiter = &self.delimiter;
        let Some(proc) = self.proc.as_mut() else {
            return Err(not_running(id, state));
        };

        let exchange = async {
            proc.write(&framed).await?;
            let mut stdout = String::new();
            while let Some(line) = proc.read_line().await? {
                match delimiter.scan_line(&line, seq) {
                    LineKind::Content => {
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    LineKind::Stale => {
                        trace!(worker_id = id, seq, "discarding output of an earlier command");
                        stdout.clear();
                    }
                    LineKind::End { before } => {
                        stdout.push_str(&before);
                        return Ok(Some(stdout));
                    }
                }
            }
            Ok::<_, std::io::Error>(None)
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(Some(stdout))) => Ok(CommandOutput {
                stdout,
                stderr: proc.drain_stderr(),
            }),
            Ok(Ok(None)) => Err(death_report(id, proc, "stdout closed".to_string()).await),
            Ok(Err(e)) => Err(death_report(id, proc, format!("I/O error: {}", e)).await),
            Err(_) => {
                let stderr = proc.drain_stderr_for(STDERR_DRAIN_WINDOW).await;
                warn!(
                    worker_id = id,
                    seq,
                    timeout_secs = timeout.as_secs_f64(),
                    stderr = %stderr.trim(),
                    "command timed out"
                );
                Err(RelayError::CommandTimeout(timeout))
            }
        }
    }
}

/// Incremental output of one command. See [`Worker::execute_stream`].
pub struct CommandStream<'a> {
    worker: &'a mut Worker,
    framer: StreamFramer,
    decoder: Utf8Decoder,
    deadline: Instant,
    timeout: Duration,
    done: bool,
}

enum Step {
    More(OutputFragment),
    Finished(OutputFragment),
}

impl CommandStream<'_> {
    /// Next output fragment, or `None` once the marker has been seen.
    ///
    /// After an error the stream is finished and yields `None`.
    pub async fn next_fragment(&mut self) -> Result<Option<OutputFragment>> {
        if self.done {
            return Ok(None);
        }
        match self.read_step().await {
            Ok(Step::More(fragment)) => Ok(Some(fragment)),
            Ok(Step::Finished(fragment)) => {
                self.finish(true);
                Ok((!fragment.is_empty()).then_some(fragment))
            }
            Err(e) => {
                self.finish(false);
                Err(e)
            }
        }
    }

    async fn read_step(&mut self) -> Result<Step> {
        let id = self.worker.id;
        let state = self.worker.state;
        let Some(proc) = self.worker.proc.as_mut() else {
            return Err(not_running(id, state));
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = match tokio::time::timeout_at(self.deadline, proc.read_chunk(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(death_report(id, proc, "stdout closed".to_string()).await);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(death_report(id, proc, format!("I/O error: {}", e)).await);
                }
                Err(_) => {
                    let stderr = proc.drain_stderr_for(STDERR_DRAIN_WINDOW).await;
                    warn!(
                        worker_id = id,
                        timeout_secs = self.timeout.as_secs_f64(),
                        stderr = %stderr.trim(),
                        "streamed command timed out"
                    );
                    return Err(RelayError::CommandTimeout(self.timeout));
                }
            };

            let text = self.decoder.decode(&buf[..n]);
            let framed = self.framer.push(&text);
            let fragment = OutputFragment {
                stdout: framed.text,
                stderr: proc.drain_stderr(),
            };
            if framed.finished {
                return Ok(Step::Finished(fragment));
            }
            if !fragment.is_empty() {
                return Ok(Step::More(fragment));
            }
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.done = true;
        self.worker.end_command(succeeded);
    }
}

impl Drop for CommandStream<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.worker.end_command(false);
        }
    }
}

fn not_running(id: usize, state: WorkerState) -> RelayError {
    RelayError::ProtocolViolation {
        worker: id,
        reason: format!("worker is {}", state),
        stderr: String::new(),
    }
}

/// Build the error for a process that stopped talking mid-command.
async fn death_report(id: usize, proc: &mut Proc, context: String) -> RelayError {
    let reason = analyze_exit_status(proc.wait_for(EXIT_PROBE_WINDOW).await);
    let stderr = proc.drain_stderr_for(STDERR_DRAIN_WINDOW).await;
    let reason = match reason {
        TerminationReason::StillAlive => context,
        reason => format!("{}, {}", context, reason),
    };
    warn!(worker_id = id, reason = %reason, "CLI worker failed");
    RelayError::ProtocolViolation {
        worker: id,
        reason,
        stderr,
    }
}
