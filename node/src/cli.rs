//! # CLI Interface
//!
//! Command-line argument structure for `chally-node` using `clap`
//! derive. Three subcommands: `run`, `init`, and `version`. Money knobs
//! (token price, caps, secrets) come from `CHALLY_*` environment
//! variables, not flags — see `chally_core::config::Settings`.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Chally financial-core node.
///
/// Serves the wallet and challenge HTTP API, ingests payment-processor
/// webhooks, runs the settlement worker, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "chally-node",
    about = "Chally financial-core node",
    version,
    propagate_version = true
)]
pub struct ChallyNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Chally node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Initialize a new data directory.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node data directory where the ledger store lives.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "CHALLY_DATA_DIR", default_value = "~/.chally")]
    pub data_dir: PathBuf,

    /// Listen address for the HTTP API.
    #[arg(long, env = "CHALLY_API_ADDR", default_value = "0.0.0.0:8180")]
    pub api_addr: String,

    /// Listen address for the Prometheus metrics endpoint.
    #[arg(long, env = "CHALLY_METRICS_ADDR", default_value = "0.0.0.0:8181")]
    pub metrics_addr: String,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, env = "CHALLY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "CHALLY_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Dev mode: temporary in-memory storage and a mock payment
    /// processor. Nothing survives a restart, no network calls leave
    /// the process.
    #[arg(long)]
    pub dev: bool,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "CHALLY_DATA_DIR", default_value = "~/.chally")]
    pub data_dir: PathBuf,

    /// Re-initialize even if the directory already exists.
    #[arg(long)]
    pub force: bool,
}

/// Expands a leading `~` to the user's home directory.
pub fn resolve_data_dir(raw: &Path) -> PathBuf {
    let Some(s) = raw.to_str() else {
        return raw.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    raw.to_path_buf()
}
