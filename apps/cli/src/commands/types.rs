//! Command type definitions shared between main.rs and the command modules.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Model catalog
    #[command(subcommand)]
    Models(ModelsCommand),

    /// Estimate a document's token count against the active model
    Estimate {
        /// Document to estimate
        document: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ingest a document into a KV cache
    ///
    /// Evaluates the whole document with the active model and saves the
    /// resulting state to the cache store.
    Ingest {
        /// Document to ingest
        document: PathBuf,

        /// Cache id (defaults to the normalized file name)
        #[arg(long)]
        id: Option<String>,

        /// Flag the new cache as the master cache
        #[arg(long)]
        master: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect and manage the cache store
    #[command(subcommand)]
    Caches(CachesCommand),

    /// Ask one question
    Ask(TurnArgs),

    /// Interactive chat, one question per line
    Chat(TurnArgs),
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsCommand {
    /// List models whose weights are present
    List {
        /// Include catalog models that are not downloaded
        #[arg(long)]
        all: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CachesCommand {
    /// List tracked caches, most recently used first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one cache
    Info {
        /// Cache id or blob path
        cache: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a cache and its blob
    Purge {
        /// Cache id or blob path
        cache: String,
    },

    /// Delete every cache
    PurgeAll {
        /// Skip the confirmation requirement
        #[arg(long)]
        yes: bool,
    },

    /// Total size of the cache store
    Size {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List caches too large for a context window
    Check {
        /// Context window in tokens (defaults to the active model's)
        #[arg(long)]
        window: Option<u64>,
    },

    /// Show or set the master cache
    Master {
        /// Cache id or blob path to flag as master
        cache: Option<String>,
    },

    /// Reconcile the registry with the store directory
    Scan,
}

#[derive(Args, Debug, Clone)]
pub struct TurnArgs {
    /// Question (ask only)
    pub message: Vec<String>,

    /// Cache id or blob path to answer from (defaults to the master cache)
    #[arg(long)]
    pub cache: Option<String>,

    /// Answer without cached state
    #[arg(long)]
    pub no_cache: bool,

    /// Keep the cache resident before answering
    #[arg(long)]
    pub warm: bool,

    /// Token budget per answer
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Chat history file to resume from and save to
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Output the turn outcome as JSON (ask only)
    #[arg(long)]
    pub json: bool,
}
