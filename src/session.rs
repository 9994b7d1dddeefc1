//! Request orchestration over the worker pool.
//!
//! One chat request maps to one checked-out worker:
//!
//! 1. acquire a worker (FIFO, bounded wait)
//! 2. send the reset command so no context leaks between requests
//! 3. send the prompt and collect (or stream) the reply
//! 4. optionally query usage with the stats command
//! 5. release the worker, on every path
//!
//! Step 5 is carried by [`PooledWorker`]'s drop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chunker::{Chunker, DEFAULT_MAX_CHUNK_CHARS};
use crate::error::{RelayError, Result};
use crate::sanitize::{StreamSanitizer, sanitize_smart};
use crate::usage::{TokenUsage, parse_usage};
use crate::worker::{PooledWorker, WorkerPool};

/// Buffered events between a streaming worker task and its consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// A finished completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Sanitized reply text.
    pub text: String,
    pub usage: TokenUsage,
    /// Whether `usage` is an estimate rather than reported by the CLI.
    pub usage_estimated: bool,
}

/// One event of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Next piece of reply text.
    Delta(String),
    /// The reply is complete.
    Done(TokenUsage),
}

/// Receiving end of a streamed completion.
pub type CompletionStream = mpsc::Receiver<Result<StreamEvent>>;

/// Per-request behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for each command sent to a worker.
    pub command_timeout: Duration,
    /// Sent before every prompt to clear conversation state.
    pub reset_command: Option<String>,
    /// Sent after every prompt to read token usage.
    pub stats_command: Option<String>,
    /// Chunk size limit for streamed text without boundaries.
    pub chunk_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
            reset_command: Some("/clear".to_string()),
            stats_command: None,
            chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

/// Turns chat prompts into worker commands.
#[derive(Clone)]
pub struct SessionOrchestrator {
    pool: WorkerPool,
    config: Arc<SessionConfig>,
}

impl SessionOrchestrator {
    pub fn new(pool: WorkerPool, config: SessionConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run a prompt to completion.
    pub async fn complete(&self, prompt: &str) -> Result<Completion> {
        let command = prompt_command(prompt)?;
        let mut worker = self.pool.acquire().await?;
        debug!(worker_id = worker.id(), "running prompt");

        reset(&mut worker, &self.config).await;
        let output = match worker.execute(&command, self.config.command_timeout).await {
            Ok(output) => output,
            Err(e) => {
                if e.is_fatal_to_worker() {
                    warn!(worker_id = worker.id(), error = %e, "worker lost during prompt");
                } else if e.is_timeout() {
                    warn!(worker_id = worker.id(), "prompt timed out; worker kept for the next request");
                }
                return Err(e);
            }
        };
        if !output.stderr.trim().is_empty() {
            debug!(worker_id = worker.id(), stderr = %output.stderr.trim(), "CLI stderr");
        }
        let text = sanitize_smart(&output.stdout);

        let reported = query_usage(&mut worker, &self.config).await;
        self.pool.release(worker);

        let (usage, usage_estimated) = TokenUsage::resolve(reported, prompt, &text);
        Ok(Completion {
            text,
            usage,
            usage_estimated,
        })
    }

    /// Run a prompt and stream the reply.
    ///
    /// The worker is acquired before returning, so pool errors surface here
    /// rather than in the stream. If the receiver is dropped the command
    /// still runs to its marker before the worker is released.
    pub async fn complete_stream(&self, prompt: &str) -> Result<CompletionStream> {
        let command = prompt_command(prompt)?;
        let worker = self.pool.acquire().await?;
        debug!(worker_id = worker.id(), "streaming prompt");

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let config = Arc::clone(&self.config);
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            stream_reply(worker, command, prompt, config, tx).await;
        });
        Ok(rx)
    }
}

/// Build the single-line command for a prompt.
///
/// The CLI submits on newline, so embedded line breaks are flattened.
pub fn prompt_command(prompt: &str) -> Result<String> {
    let command = prompt
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if command.is_empty() {
        return Err(RelayError::EmptyPrompt);
    }
    Ok(command)
}

async fn reset(worker: &mut PooledWorker, config: &SessionConfig) {
    let Some(reset) = config.reset_command.as_deref() else {
        return;
    };
    if let Err(e) = worker.execute(reset, config.command_timeout).await {
        warn!(worker_id = worker.id(), error = %e, "reset command failed");
    }
}

async fn query_usage(worker: &mut PooledWorker, config: &SessionConfig) -> Option<TokenUsage> {
    let stats = config.stats_command.as_deref()?;
    match worker.execute(stats, config.command_timeout).await {
        Ok(output) => match parse_usage(&output.stdout) {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(worker_id = worker.id(), error = %e, "usage not reported");
                None
            }
        },
        Err(e) => {
            warn!(worker_id = worker.id(), error = %e, "stats command failed");
            None
        }
    }
}

/// Forward events unless the consumer has gone away.
struct Forwarder {
    tx: mpsc::Sender<Result<StreamEvent>>,
    connected: bool,
}

impl Forwarder {
    async fn send(&mut self, event: Result<StreamEvent>) {
        if self.connected && self.tx.send(event).await.is_err() {
            debug!("stream consumer disconnected, draining command output");
            self.connected = false;
        }
    }
}

async fn stream_reply(
    mut worker: PooledWorker,
    command: String,
    prompt: String,
    config: Arc<SessionConfig>,
    tx: mpsc::Sender<Result<StreamEvent>>,
) {
    let mut out = Forwarder {
        tx,
        connected: true,
    };

    reset(&mut worker, &config).await;

    let mut completion = String::new();
    let mut sanitizer = StreamSanitizer::new();
    let mut chunker = Chunker::new(config.chunk_chars);
    let streamed = async {
        let mut stream = worker
            .execute_stream(&command, config.command_timeout)
            .await?;
        while let Some(fragment) = stream.next_fragment().await? {
            if !fragment.stderr.trim().is_empty() {
                debug!(stderr = %fragment.stderr.trim(), "CLI stderr");
            }
            for chunk in chunker.push(&sanitizer.push(&fragment.stdout)) {
                completion.push_str(&chunk);
                out.send(Ok(StreamEvent::Delta(chunk))).await;
            }
        }
        let mut tail = chunker.push(&sanitizer.finish());
        tail.extend(chunker.finish());
        for chunk in tail {
            completion.push_str(&chunk);
            out.send(Ok(StreamEvent::Delta(chunk))).await;
        }
        Ok::<_, RelayError>(())
    }
    .await;

    match streamed {
        Ok(()) => {
            let reported = query_usage(&mut worker, &config).await;
            worker.release();
            let (usage, _) = TokenUsage::resolve(reported, &prompt, completion.trim());
            out.send(Ok(StreamEvent::Done(usage))).await;
        }
        Err(e) => {
            worker.release();
            out.send(Err(e)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPoolConfig;
    use crate::worker::test_support::fake_repl_spec;

    async fn orchestrator(config: SessionConfig) -> SessionOrchestrator {
        let pool = WorkerPool::initialize(WorkerPoolConfig {
            size: 1,
            acquire_timeout: Duration::from_secs(5),
            ..WorkerPoolConfig::new(fake_repl_spec())
        })
        .await
        .unwrap();
        SessionOrchestrator::new(pool, config)
    }

    async fn collect(mut rx: CompletionStream) -> (String, Option<TokenUsage>, Option<RelayError>) {
        let mut text = String::new();
        let mut usage = None;
        let mut error = None;
        while let Some(event) = rx.recv().await {
            match event {
                Ok(StreamEvent::Delta(delta)) => text.push_str(&delta),
                Ok(StreamEvent::Done(u)) => usage = Some(u),
                Err(e) => error = Some(e),
            }
        }
        (text, usage, error)
    }

    #[test]
    fn test_prompt_command_flattens_lines() {
        assert_eq!(
            prompt_command("first line\n  second line\r\n\nthird").unwrap(),
            "first line second line third"
        );
        assert!(matches!(prompt_command(" \n\t"), Err(RelayError::EmptyPrompt)));
        assert!(matches!(prompt_command(""), Err(RelayError::EmptyPrompt)));
    }

    #[tokio::test]
    async fn test_complete_sanitizes_and_estimates() {
        let session = orchestrator(SessionConfig::default()).await;
        let completion = session.complete("hello").await.unwrap();
        assert_eq!(completion.text, "reply: hello");
        assert!(completion.usage_estimated);
        assert_eq!(completion.usage, TokenUsage::estimate("hello", "reply: hello"));
        assert_eq!(session.pool().stats().idle, 1);
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_complete_with_reported_usage() {
        let session = orchestrator(SessionConfig {
            stats_command: Some("/stats".to_string()),
            ..SessionConfig::default()
        })
        .await;
        let completion = session.complete("What is 5 + 3?").await.unwrap();
        assert_eq!(completion.text, "reply: What is 5 + 3?");
        assert!(!completion.usage_estimated);
        assert_eq!(completion.usage, TokenUsage::new(3, 5));
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_unparseable_stats_falls_back_to_estimate() {
        let session = orchestrator(SessionConfig {
            stats_command: Some("no stats here".to_string()),
            ..SessionConfig::default()
        })
        .await;
        let completion = session.complete("hello").await.unwrap();
        assert!(completion.usage_estimated);
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_released_on_timeout() {
        let session = orchestrator(SessionConfig {
            command_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        })
        .await;
        let err = session.complete("sleep 1").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.pool().stats().idle, 1);
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected_before_acquire() {
        let session = orchestrator(SessionConfig::default()).await;
        assert!(matches!(
            session.complete("   ").await,
            Err(RelayError::EmptyPrompt)
        ));
        assert!(matches!(
            session.complete_stream("").await,
            Err(RelayError::EmptyPrompt)
        ));
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_complete_stream() {
        let session = orchestrator(SessionConfig::default()).await;
        let rx = session.complete_stream("hello world").await.unwrap();
        let (text, usage, error) = collect(rx).await;
        assert!(error.is_none());
        assert_eq!(text.trim(), "reply: hello world");
        assert!(usage.is_some());

        // The worker is back and usable.
        let completion = session.complete("again").await.unwrap();
        assert_eq!(completion.text, "reply: again");
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_error_is_forwarded() {
        let session = orchestrator(SessionConfig::default()).await;
        let rx = session.complete_stream("exit").await.unwrap();
        let (_, usage, error) = collect(rx).await;
        assert!(usage.is_none());
        assert!(matches!(error, Some(RelayError::ProtocolViolation { .. })));
        session.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_stream_consumer_releases_worker() {
        let session = orchestrator(SessionConfig::default()).await;
        let rx = session.complete_stream("hello").await.unwrap();
        drop(rx);
        // The streaming task drains to the marker and checks the worker in.
        let completion = session.complete("next").await.unwrap();
        assert_eq!(completion.text, "reply: next");
        session.pool().shutdown().await;
    }
}
