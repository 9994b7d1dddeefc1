//! Backend abstraction over pooled and one-shot CLI access.
//!
//! The server and the `ask` command talk to a [`Backend`] without caring
//! whether requests go to a warm interactive process or a fresh one.

use tracing::debug;

use crate::config::{BackendMode, RelayConfig};
use crate::error::Result;
use crate::oneshot::OneShotRunner;
use crate::session::{Completion, CompletionStream, SessionOrchestrator};
use crate::worker::{WorkerPool, WorkerPoolStats};

/// How requests reach the CLI.
pub enum Backend {
    /// Interactive processes from a worker pool.
    Pooled(SessionOrchestrator),
    /// One process per request.
    OneShot(OneShotRunner),
}

impl Backend {
    /// Build the backend selected by `config.mode`.
    ///
    /// In pooled mode this starts the workers and fails if none come up.
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        match config.mode {
            BackendMode::Pooled => {
                let pool = WorkerPool::initialize(config.pool_config()).await?;
                Ok(Backend::Pooled(SessionOrchestrator::new(
                    pool,
                    config.session_config(),
                )))
            }
            BackendMode::Oneshot => Ok(Backend::OneShot(config.oneshot_runner())),
        }
    }

    pub fn mode(&self) -> BackendMode {
        match self {
            Backend::Pooled(_) => BackendMode::Pooled,
            Backend::OneShot(_) => BackendMode::Oneshot,
        }
    }

    /// Run a prompt to completion.
    ///
    /// Pooled workers run whatever model they were launched with, so `model`
    /// only applies to one-shot mode.
    pub async fn complete(&self, prompt: &str, model: &str) -> Result<Completion> {
        match self {
            Backend::Pooled(session) => {
                debug!(model, "pooled request; model fixed at launch");
                session.complete(prompt).await
            }
            Backend::OneShot(runner) => runner.run(prompt, model).await,
        }
    }

    /// Run a prompt and stream the reply.
    pub async fn complete_stream(&self, prompt: &str, model: &str) -> Result<CompletionStream> {
        match self {
            Backend::Pooled(session) => {
                debug!(model, "pooled request; model fixed at launch");
                session.complete_stream(prompt).await
            }
            Backend::OneShot(runner) => runner.run_stream(prompt, model).await,
        }
    }

    /// The model reported to clients as the default.
    pub async fn default_model(&self, configured: &str) -> String {
        match self {
            Backend::Pooled(_) => configured.to_string(),
            Backend::OneShot(runner) => runner.probe().await,
        }
    }

    pub fn pool_stats(&self) -> Option<WorkerPoolStats> {
        match self {
            Backend::Pooled(session) => Some(session.pool().stats()),
            Backend::OneShot(_) => None,
        }
    }

    /// Whether requests can currently be served.
    pub fn is_healthy(&self) -> bool {
        match self {
            Backend::Pooled(session) => {
                !session.pool().is_closed() && session.pool().stats().live > 0
            }
            Backend::OneShot(_) => true,
        }
    }

    /// Stop pooled workers. No-op for one-shot mode.
    pub async fn shutdown(&self) {
        if let Backend::Pooled(session) = self {
            session.pool().shutdown().await;
        }
    }
}
