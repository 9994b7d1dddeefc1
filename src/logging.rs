//! Logging setup for clirelay.
//!
//! # Environment Variables
//!
//! - `CLIRELAY_LOG` - Log filter (overrides RUST_LOG)
//! - `CLIRELAY_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `CLIRELAY_LOG_FORMAT` - Output format: pretty, compact, json
//! - `CLIRELAY_LOG_FILE` - Path to log file (in addition to stderr)
//! - `CLIRELAY_LOG_ROTATION` - File rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Command-line verbosity flags win over all of these.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// Single file
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter is set (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Log file, in addition to stderr
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; overrides `level` when set
    pub filter: Option<String>,
    /// Show the module target (default: true)
    pub show_target: bool,
    /// Colored stderr output (default: true)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            show_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the HTTP server: INFO, compact lines.
    pub fn for_server() -> Self {
        Self::default().with_format(LogFormat::Compact)
    }

    /// Preset for one-off commands: only warnings and errors, no targets.
    pub fn for_command() -> Self {
        Self {
            level: Level::WARN,
            show_target: false,
            ..Self::default()
        }
        .with_format(LogFormat::Compact)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line is left alone.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var("CLIRELAY_LOG").or_else(|| var("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = var("CLIRELAY_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }

        if let Some(format) = var("CLIRELAY_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }

        if let Some(path) = var("CLIRELAY_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Some(rotation) = var("CLIRELAY_LOG_ROTATION").and_then(|r| r.parse().ok()) {
            self.rotation = rotation;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    /// A formatting layer for `writer` in the configured format.
    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and also to `config.file_path` when set. Calling this more
/// than once has no effect.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.fmt_layer(std::io::stderr, config.ansi)];

    if let Some(path) = config.file_path.as_ref() {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clirelay.log");
        let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
        layers.push(config.fmt_layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
