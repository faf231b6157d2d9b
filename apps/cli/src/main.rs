//! kvchat CLI - chat with documents through persisted model state.
//!
//! This CLI provides a `kvchat` command over the cache lifecycle manager:
//! ingest documents into KV caches, inspect and purge the cache store, and
//! answer questions from a cached document.

mod commands;

use anyhow::Context;
use clap::Parser;
use kvchat_core::{CacheService, CoreConfig};
use std::path::PathBuf;

use commands::{Command, ask, caches, estimate, ingest, models};

/// kvchat - chat with documents through persisted model state
///
/// kvchat primes a language model with a document once, saves the model's
/// attention state to disk, and reuses it to answer questions later.
#[derive(Parser, Debug)]
#[command(name = "kvchat", author, version, about = "kvchat - chat with documents through persisted model state")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (defaults to ~/.kvchat/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Model to use (overrides the configured model)
    #[arg(short, long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    kvchat_core::logging::init(&args.log_level, args.json_logs)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    let config_path = args.config.unwrap_or_else(CoreConfig::default_path);
    let config = CoreConfig::load(Some(config_path.as_path()))
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let service = CacheService::open(config).context("Failed to open cache store")?;
    if let Some(model_id) = &args.model {
        service.set_model(model_id).await.with_context(|| format!("Model '{model_id}' is not available"))?;
    }

    let result = match args.command {
        Command::Models(cmd) => models::execute(&service, cmd),
        Command::Estimate { document, json } => estimate::execute(&service, &document, json).await,
        Command::Ingest { document, id, master, json } => {
            ingest::execute(&service, document, id, master, json).await
        }
        Command::Caches(cmd) => caches::execute(&service, cmd).await,
        Command::Ask(options) => ask::execute(&service, options).await,
        Command::Chat(options) => ask::chat(&service, options).await,
    };

    service.shutdown().await;
    result
}
