//! Per-request debug dumps.
//!
//! When enabled, every chat request leaves a JSON file behind describing what
//! was asked, what came back and how long it took. Writing a dump never fails
//! a request; problems are logged and ignored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BackendMode;
use crate::usage::TokenUsage;

/// Everything recorded about one request.
#[derive(Debug, Clone, Serialize)]
pub struct DumpRecord {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mode: BackendMode,
    pub model: String,
    pub stream: bool,
    /// The request body as received.
    pub request: serde_json::Value,
    /// Final reply text, or everything streamed before a failure.
    pub response: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl DumpRecord {
    pub fn new(
        request_id: impl Into<String>,
        mode: BackendMode,
        model: impl Into<String>,
        stream: bool,
        request: serde_json::Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            mode,
            model: model.into(),
            stream,
            request,
            response: None,
            usage: None,
            error: None,
        }
    }

    /// Record a successful reply.
    pub fn succeed(mut self, response: impl Into<String>, usage: TokenUsage) -> Self {
        self.finished_at = Some(Utc::now());
        self.response = Some(response.into());
        self.usage = Some(usage);
        self
    }

    /// Record a failure, keeping any partial output.
    pub fn fail(mut self, partial: Option<String>, error: impl ToString) -> Self {
        self.finished_at = Some(Utc::now());
        self.response = partial.filter(|text| !text.is_empty());
        self.error = Some(error.to_string());
        self
    }

    pub fn outcome(&self) -> &'static str {
        if self.error.is_some() { "error" } else { "ok" }
    }

    fn file_name(&self) -> String {
        let id: String = self
            .request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}_{}.json", id, self.outcome())
    }
}

/// Writes [`DumpRecord`]s to a directory, or does nothing when disabled.
#[derive(Debug, Clone, Default)]
pub struct DebugDumper {
    dir: Option<PathBuf>,
}

impl DebugDumper {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Write a record. Returns the path written, if any.
    pub async fn write(&self, record: &DumpRecord) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let path = dir.join(record.file_name());

        let body = match serde_json::to_vec_pretty(record) {
            Ok(body) => body,
            Err(e) => {
                warn!(request_id = %record.request_id, error = %e, "failed to serialize debug dump");
                return None;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to create debug dump directory");
            return None;
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => {
                debug!(path = %path.display(), "wrote debug dump");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write debug dump");
                None
            }
        }
    }
}
