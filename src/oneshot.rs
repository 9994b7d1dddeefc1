//! One-shot CLI invocation.
//!
//! Spawns a fresh `cli -m MODEL -p PROMPT` process per request. Slower than
//! the pooled workers (every request pays process startup) but needs no
//! framing: the process exits when the reply is complete.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chunker::{Chunker, DEFAULT_MAX_CHUNK_CHARS, Utf8Decoder};
use crate::error::{RelayError, Result};
use crate::sanitize::{StreamSanitizer, sanitize};
use crate::session::{Completion, CompletionStream, STREAM_CHANNEL_CAPACITY, StreamEvent};
use crate::usage::TokenUsage;

/// Model reported when the CLI's help text names no default.
pub const FALLBACK_MODEL: &str = "gemini-2.5-pro";

/// How long `probe` waits for `--help`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 1024;

/// `default: "gemini-2.5-pro"` in the CLI's help output.
static DEFAULT_MODEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"default:\s*"(.*?)""#).expect("static model pattern"));

/// The prompt travels as a single argument, newlines included.
fn require_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(RelayError::EmptyPrompt);
    }
    Ok(())
}

/// Runs one CLI process per request.
#[derive(Debug, Clone)]
pub struct OneShotRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    chunk_chars: usize,
    fallback_model: String,
}

impl OneShotRunner {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            fallback_model: FALLBACK_MODEL.to_string(),
        }
    }

    /// Extra arguments placed before `-m` and `-p`.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }

    /// Model reported by [`OneShotRunner::probe`] when the CLI names none.
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }

    fn spawn(&self, args: &[&str]) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(|e| RelayError::ProcessLaunch {
            path: self.program.clone(),
            source: e,
        })
    }

    /// Run a prompt and wait for the full reply.
    pub async fn run(&self, prompt: &str, model: &str) -> Result<Completion> {
        require_prompt(prompt)?;
        let child = self.spawn(&["-m", model, "-p", prompt])?;
        debug!(program = %self.program, model, "running one-shot CLI");

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(RelayError::CommandTimeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(RelayError::CliFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = sanitize(&String::from_utf8_lossy(&output.stdout))
            .trim()
            .to_string();
        Ok(Completion {
            usage: TokenUsage::estimate(prompt, &text),
            usage_estimated: true,
            text,
        })
    }

    /// Run a prompt and stream the reply as it is printed.
    pub async fn run_stream(&self, prompt: &str, model: &str) -> Result<CompletionStream> {
        require_prompt(prompt)?;
        let child = self.spawn(&["-m", model, "-p", prompt])?;
        debug!(program = %self.program, model, "streaming one-shot CLI");

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        let chunk_chars = self.chunk_chars;
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let result = stream_child(child, deadline, timeout, chunk_chars, &tx).await;
            let event = result.map(|completion| {
                StreamEvent::Done(TokenUsage::estimate(&prompt, completion.trim()))
            });
            // Nothing to do if the consumer is gone; the child is already reaped.
            let _ = tx.send(event).await;
        });
        Ok(rx)
    }

    /// Ask the CLI for its default model via `--help`.
    ///
    /// Falls back to the configured model on any failure.
    pub async fn probe(&self) -> String {
        let help = match self.spawn(&["--help"]) {
            Ok(child) => tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await,
            Err(e) => {
                warn!(error = %e, "model probe failed");
                return self.fallback_model.clone();
            }
        };
        match help {
            Ok(Ok(output)) => {
                let text = String::from_utf8_lossy(&output.stdout);
                DEFAULT_MODEL
                    .captures(&text)
                    .map(|caps| caps[1].to_string())
                    .filter(|model| !model.is_empty())
                    .unwrap_or_else(|| self.fallback_model.clone())
            }
            _ => self.fallback_model.clone(),
        }
    }
}

/// Pump a one-shot child's stdout into `tx`. Returns the streamed text.
async fn stream_child(
    mut child: Child,
    deadline: Instant,
    timeout: Duration,
    chunk_chars: usize,
    tx: &mpsc::Sender<Result<StreamEvent>>,
) -> Result<String> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).trim().to_string()
        })
    });

    let mut decoder = Utf8Decoder::new();
    let mut sanitizer = StreamSanitizer::new();
    let mut chunker = Chunker::new(chunk_chars);
    let mut completion = String::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = match tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(RelayError::CommandTimeout(timeout));
            }
        };
        let text = if n == 0 {
            let mut rest = sanitizer.push(&decoder.finish());
            rest.push_str(&sanitizer.finish());
            rest
        } else {
            sanitizer.push(&decoder.decode(&buf[..n]))
        };

        let mut chunks = chunker.push(&text);
        if n == 0 {
            chunks.extend(chunker.finish());
        }
        for chunk in chunks {
            completion.push_str(&chunk);
            if tx.send(Ok(StreamEvent::Delta(chunk))).await.is_err() {
                debug!("stream consumer disconnected, stopping one-shot CLI");
                let _ = child.kill().await;
                return Ok(completion);
            }
        }
        if n == 0 {
            break;
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(RelayError::CommandTimeout(timeout));
        }
    };
    if !status.success() {
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        return Err(RelayError::CliFailed {
            code: status.code().unwrap_or(-1),
            stderr,
        });
    }
    Ok(completion)
}
