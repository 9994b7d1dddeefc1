//! clirelay - OpenAI-compatible chat API backed by interactive CLI model clients

mod backend;
mod chunker;
mod cli;
mod config;
mod dump;
mod error;
mod logging;
mod oneshot;
mod paths;
mod sanitize;
mod server;
mod session;
mod usage;
pub mod version;
mod worker;

use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::json;

use backend::Backend;
use cli::{Cli, Commands};
use config::RelayConfig;
use dump::{DebugDumper, DumpRecord};
use logging::LogConfig;
use session::StreamEvent;
use usage::TokenUsage;

/// Parse arguments, run the selected command, and print any error chain.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Ask(args) => cmd_ask(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Set up logging from the command's preset, then env vars, then `-v`/`-q`.
fn init_logging(cli: &Cli, preset: LogConfig) {
    let mut config = preset.with_ansi(!cli.no_color);
    if let Some(level) = cli.verbosity().level() {
        config = config.with_filter(level.to_string().to_lowercase());
    }
    logging::init(config.with_env_overrides());
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")
}

fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    use crate::server::{ServerConfig, run_server};

    init_logging(cli, LogConfig::for_server());

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        cors: args.cors,
        cors_origins: args.cors_origins.clone(),
        relay: args.backend.to_config(),
    };

    runtime()?.block_on(run_server(config))?;

    Ok(())
}

fn cmd_ask(cli: &Cli, args: &cli::AskArgs) -> Result<()> {
    init_logging(cli, LogConfig::for_command());
    runtime()?.block_on(run_ask(args, args.backend.to_config()))
}

async fn run_ask(args: &cli::AskArgs, mut config: RelayConfig) -> Result<()> {
    let backend = Backend::from_config(&config).await?;
    if args.model.is_none() {
        config.default_model = backend.default_model(&config.default_model).await;
    }
    let model = config.resolve_model(args.model.as_deref());
    let dumper = DebugDumper::new(config.debug_dump_dir.clone());
    let record = DumpRecord::new(
        uuid::Uuid::new_v4().to_string(),
        backend.mode(),
        &model,
        args.stream,
        json!({ "prompt": args.prompt, "model": args.model }),
    );

    let result = if args.stream {
        ask_stream(&backend, &args.prompt, &model).await
    } else {
        ask_once(&backend, &args.prompt, &model).await
    };
    backend.shutdown().await;

    let (text, usage) = match result {
        Ok(reply) => reply,
        Err(e) => {
            dumper.write(&record.fail(None, &e)).await;
            return Err(e);
        }
    };
    if args.usage {
        eprintln!(
            "{} prompt={} completion={} total={}",
            "usage:".if_supports_color(Stderr, |text| text.dimmed()),
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens
        );
    }
    dumper.write(&record.succeed(text, usage)).await;
    Ok(())
}

async fn ask_once(backend: &Backend, prompt: &str, model: &str) -> Result<(String, TokenUsage)> {
    let completion = backend.complete(prompt, model).await?;
    println!("{}", completion.text);
    Ok((completion.text, completion.usage))
}

async fn ask_stream(backend: &Backend, prompt: &str, model: &str) -> Result<(String, TokenUsage)> {
    let mut rx = backend.complete_stream(prompt, model).await?;
    let mut stdout = std::io::stdout();
    let mut text = String::new();

    while let Some(event) = rx.recv().await {
        match event? {
            StreamEvent::Delta(delta) => {
                stdout.write_all(delta.as_bytes())?;
                stdout.flush()?;
                text.push_str(&delta);
            }
            StreamEvent::Done(usage) => {
                if !text.ends_with('\n') {
                    writeln!(stdout)?;
                }
                return Ok((text, usage));
            }
        }
    }
    anyhow::bail!("stream ended before the reply was complete")
}
