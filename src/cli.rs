//! Command-line interface definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::Level;

use crate::config::{BackendMode, RelayConfig};
use crate::oneshot::FALLBACK_MODEL;
use crate::paths;

/// OpenAI-compatible chat API in front of an interactive command-line model client.
#[derive(Parser, Debug)]
#[command(name = "clirelay")]
#[command(author, version = crate::version::clap_version(), long_version = crate::version::long_version(), about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API server.
    Serve(ServeArgs),

    /// Send one prompt and print the reply.
    Ask(AskArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "clirelay",
            &mut std::io::stdout(),
        );
    }
}

/// How to reach the CLI model client.
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// CLI executable name or path.
    #[arg(long, env = "CLIRELAY_CLI_PATH", default_value = "gemini")]
    pub cli_path: String,

    /// Extra argument passed to every CLI launch (repeatable).
    #[arg(long = "cli-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub cli_args: Vec<String>,

    /// Keep interactive processes warm, or spawn one per request.
    #[arg(long, value_enum, env = "CLIRELAY_MODE", default_value_t = BackendMode::Pooled)]
    pub mode: BackendMode,

    /// Number of pooled CLI processes.
    #[arg(long, env = "CLIRELAY_POOL_SIZE", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub pool_size: u16,

    /// Seconds allowed for one command.
    #[arg(long, env = "CLIRELAY_COMMAND_TIMEOUT", default_value_t = 120, value_name = "SECS")]
    pub command_timeout: u64,

    /// Seconds to wait for an idle worker before answering 503.
    #[arg(long, env = "CLIRELAY_ACQUIRE_TIMEOUT", default_value_t = 30, value_name = "SECS")]
    pub acquire_timeout: u64,

    /// Command sent before each prompt to clear conversation state.
    #[arg(long, env = "CLIRELAY_RESET_COMMAND", default_value = "/clear")]
    pub reset_command: String,

    /// Do not send a reset command before prompts.
    #[arg(long)]
    pub no_reset: bool,

    /// Command sent after each prompt to read token usage.
    #[arg(long, env = "CLIRELAY_STATS_COMMAND")]
    pub stats_command: Option<String>,

    /// Model reported for the `clirelay` alias.
    #[arg(long, env = "CLIRELAY_DEFAULT_MODEL", default_value = FALLBACK_MODEL)]
    pub default_model: String,

    /// Drop dead workers instead of restarting them.
    #[arg(long)]
    pub no_respawn: bool,

    /// Write a JSON dump of every request.
    #[arg(long, env = "CLIRELAY_DEBUG_DUMP")]
    pub debug_dump: bool,

    /// Directory for request dumps (implies --debug-dump).
    #[arg(long, env = "CLIRELAY_DEBUG_DUMP_DIR")]
    pub debug_dump_dir: Option<PathBuf>,
}

impl BackendArgs {
    /// Assemble a [`RelayConfig`], filling in defaults for what the flags leave open.
    pub fn to_config(&self) -> RelayConfig {
        let debug_dump_dir = match (&self.debug_dump_dir, self.debug_dump) {
            (Some(dir), _) => Some(paths::expand_tilde(dir)),
            (None, true) => Some(paths::get_dump_dir()),
            (None, false) => None,
        };
        let non_empty = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());

        RelayConfig {
            cli_path: self.cli_path.clone(),
            cli_args: self.cli_args.clone(),
            mode: self.mode,
            pool_size: usize::from(self.pool_size),
            command_timeout: Duration::from_secs(self.command_timeout),
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            reset_command: if self.no_reset {
                None
            } else {
                non_empty(&self.reset_command)
            },
            stats_command: self.stats_command.as_deref().and_then(non_empty),
            default_model: self.default_model.clone(),
            respawn: !self.no_respawn,
            debug_dump_dir,
            ..RelayConfig::default()
        }
    }
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Host address to bind to.
    #[arg(long, env = "CLIRELAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "CLIRELAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Allow cross-origin requests from any origin.
    #[arg(long)]
    pub cors: bool,

    /// Comma-separated origins allowed for cross-origin requests.
    #[arg(long, value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Arguments for the ask command.
#[derive(Parser, Debug)]
pub struct AskArgs {
    /// Prompt text.
    pub prompt: String,

    /// Model to use (one-shot mode only).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Print the reply as it arrives.
    #[arg(short, long)]
    pub stream: bool,

    /// Print token usage to stderr after the reply.
    #[arg(long)]
    pub usage: bool,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Verbosity requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default level for the command.
    Normal,
    /// -v
    Info,
    /// -vv
    Debug,
    /// -vvv
    Trace,
}

impl Verbosity {
    /// The log level to use, or `None` for the command's default.
    pub fn level(self) -> Option<Level> {
        match self {
            Verbosity::Quiet => Some(Level::ERROR),
            Verbosity::Normal => None,
            Verbosity::Info => Some(Level::INFO),
            Verbosity::Debug => Some(Level::DEBUG),
            Verbosity::Trace => Some(Level::TRACE),
        }
    }
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let args = Cli::try_parse_from(["clirelay", "serve"]).unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.host, "127.0.0.1");
                assert_eq!(serve.port, 8000);
                assert!(!serve.cors);

                let config = serve.backend.to_config();
                assert_eq!(config.mode, BackendMode::Pooled);
                assert_eq!(config.pool_size, 2);
                assert_eq!(config.reset_command.as_deref(), Some("/clear"));
                assert_eq!(config.command_timeout, Duration::from_secs(120));
                assert!(config.respawn);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_options() {
        let args = Cli::try_parse_from([
            "clirelay",
            "serve",
            "--port",
            "9000",
            "--pool-size",
            "4",
            "--mode",
            "oneshot",
            "--cors-origins",
            "http://a.test,http://b.test",
            "--cli-arg",
            "--yolo",
            "--cli-arg",
            "-m",
            "--cli-arg",
            "gemini-2.5-flash",
            "--no-reset",
            "--no-respawn",
            "--stats-command",
            "/stats",
        ])
        .unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.port, 9000);
                assert_eq!(
                    serve.cors_origins,
                    Some(vec!["http://a.test".to_string(), "http://b.test".to_string()])
                );
                let config = serve.backend.to_config();
                assert_eq!(config.mode, BackendMode::Oneshot);
                assert_eq!(config.pool_size, 4);
                assert_eq!(config.cli_args, vec!["--yolo", "-m", "gemini-2.5-flash"]);
                assert!(config.reset_command.is_none());
                assert_eq!(config.stats_command.as_deref(), Some("/stats"));
                assert!(!config.respawn);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_pool_size_must_be_positive() {
        assert!(Cli::try_parse_from(["clirelay", "serve", "--pool-size", "0"]).is_err());
    }

    #[test]
    fn test_ask_command() {
        let args =
            Cli::try_parse_from(["clirelay", "ask", "hello world", "-m", "m1", "--stream"]).unwrap();
        match args.command {
            Commands::Ask(ask) => {
                assert_eq!(ask.prompt, "hello world");
                assert_eq!(ask.model.as_deref(), Some("m1"));
                assert!(ask.stream);
                assert!(!ask.usage);
            }
            _ => panic!("Expected Ask command"),
        }
    }

    #[test]
    fn test_debug_dump_dir() {
        let args = Cli::try_parse_from([
            "clirelay",
            "ask",
            "hi",
            "--debug-dump-dir",
            "/tmp/dumps",
        ])
        .unwrap();
        match args.command {
            Commands::Ask(ask) => {
                let config = ask.backend.to_config();
                assert_eq!(config.debug_dump_dir, Some(PathBuf::from("/tmp/dumps")));
            }
            _ => panic!("Expected Ask command"),
        }
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from(["clirelay", "-vv", "--no-color", "serve"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        assert_eq!(args.verbosity(), Verbosity::Debug);
        assert_eq!(args.verbosity().level(), Some(Level::DEBUG));

        let args = Cli::try_parse_from(["clirelay", "serve", "-q"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["clirelay", "-v", "-q", "serve"]);
        assert!(result.is_err());
    }
}
