//! # Chally Node
//!
//! Entry point for the `chally-node` binary. Parses CLI arguments,
//! resolves settings from the environment, wires the financial core
//! together, and serves the HTTP API plus the settlement worker.
//!
//! Subcommands:
//!
//! - `run`     — start the node
//! - `init`    — initialize the data directory
//! - `version` — print build version information

mod api;
mod cli;
mod jobs;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use chally_challenges::challenge::{ChallengeLocks, ChallengeRegistry};
use chally_challenges::participant::Enrollment;
use chally_challenges::settlement::SettlementEngine;
use chally_core::config::{Settings, WithdrawMode};
use chally_core::deposit::DepositPipeline;
use chally_core::ledger::Ledger;
use chally_core::processor::{MockProcessor, PaymentProcessor, StripeProcessor};
use chally_core::storage::CoreDb;
use chally_core::wallet::{Wallet, WalletLocks};
use chally_core::withdraw::WithdrawalEngine;

use cli::{ChallyNodeCli, Commands};
use logging::LogFormat;
use metrics::ChallyMetrics;

/// Webhook secret used in dev mode when none is configured. Matches the
/// value `stripe listen`-style tooling is pointed at during development.
const DEV_WEBHOOK_SECRET: &str = "whsec_dev";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ChallyNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — Full node startup sequence
// ---------------------------------------------------------------------------

/// Starts the full node: API server, metrics endpoint, settlement worker.
///
/// Startup sequence:
/// 1.  Resolve paths and initialize logging
/// 2.  Resolve settings from the environment
/// 3.  Open the store (temporary in dev mode)
/// 4.  Build ledger, locks, wallet
/// 5.  Choose the payment processor (mock in dev mode)
/// 6.  Build deposit/withdrawal pipelines
/// 7.  Build challenge registry, enrollment, settlement engine
/// 8.  Create metrics
/// 9.  Spawn the settlement worker
/// 10. Serve the API and metrics listeners
/// 11. Await shutdown, then stop the worker
async fn run_node(args: cli::RunArgs) -> Result<()> {
    // --- 1. Paths and logging ---
    let data_dir = cli::resolve_data_dir(&args.data_dir);
    let log_filter = format!(
        "chally_node={level},chally_core={level},chally_challenges={level},tower_http=info",
        level = args.log_level
    );
    logging::init_logging(&log_filter, LogFormat::from_str_lossy(&args.log_format));

    tracing::info!(
        api_addr = %args.api_addr,
        metrics_addr = %args.metrics_addr,
        data_dir = %data_dir.display(),
        dev = args.dev,
        "starting chally-node"
    );

    // --- 2. Settings ---
    let mut settings = Settings::from_env().context("invalid CHALLY_* environment")?;
    if args.dev && settings.webhook_secret.is_empty() {
        settings.webhook_secret = DEV_WEBHOOK_SECRET.to_string();
    }
    if !args.dev && settings.webhook_secret.is_empty() {
        tracing::warn!("no webhook secret configured — all webhook deliveries will be rejected");
    }
    if settings.withdraw_mode == WithdrawMode::Disabled {
        tracing::warn!("withdrawals are disabled by configuration");
    }
    let settings = Arc::new(settings);

    // --- 3. Store ---
    let db = if args.dev {
        Arc::new(CoreDb::open_temporary().context("failed to open temporary store for dev mode")?)
    } else {
        let db_path = data_dir.join("db");
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("failed to create store directory: {}", db_path.display()))?;
        Arc::new(
            CoreDb::open(&db_path)
                .with_context(|| format!("failed to open store at {}", db_path.display()))?,
        )
    };
    tracing::info!("store opened");

    // --- 4. Ledger, locks, wallet ---
    let ledger = Ledger::new(Arc::clone(&db), &settings.currency);
    let wallet_locks = Arc::new(WalletLocks::new());
    let wallet = Wallet::new(Arc::clone(&db), ledger, wallet_locks);

    // --- 5. Payment processor ---
    let processor: Arc<dyn PaymentProcessor> = if args.dev {
        tracing::info!("dev mode: using the mock payment processor");
        Arc::new(MockProcessor::new())
    } else {
        if settings.processor_api_key.is_empty() {
            tracing::warn!("no processor API key configured — checkout and refunds will fail");
        }
        Arc::new(StripeProcessor::new(&settings.processor_api_key))
    };

    // --- 6. Deposit / withdrawal pipelines ---
    let deposits = DepositPipeline::new(wallet.clone(), Arc::clone(&processor), Arc::clone(&settings));
    let withdrawals = WithdrawalEngine::new(
        Arc::clone(&db),
        wallet.clone(),
        Arc::clone(&processor),
        Arc::clone(&settings),
    );

    // --- 7. Challenges ---
    let registry = Arc::new(ChallengeRegistry::new(&db).context("failed to open challenge registry")?);
    let challenge_locks = Arc::new(ChallengeLocks::new());
    let enrollment = Enrollment::new(
        Arc::clone(&registry),
        wallet.clone(),
        Arc::clone(&challenge_locks),
    );
    let settlement = SettlementEngine::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        wallet.clone(),
        challenge_locks,
        settings.platform_user_id,
    )
    .context("failed to build settlement engine")?;

    // --- 8. Metrics ---
    let node_metrics = Arc::new(ChallyMetrics::new());

    // --- 9. Settlement worker ---
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = jobs::SettlementWorker::new(
        &db,
        Arc::clone(&registry),
        settlement.clone(),
        Arc::clone(&node_metrics),
    )
    .context("failed to build settlement worker")?;
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    // --- 10. API and metrics listeners ---
    let app_state = api::AppState {
        settings: Arc::clone(&settings),
        wallet,
        deposits,
        withdrawals,
        registry,
        enrollment,
        settlement,
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(&args.api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api_addr))?;
    tracing::info!("API server listening on {}", args.api_addr);

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    tracing::info!("metrics server listening on {}", args.metrics_addr);

    print_startup_banner(&args.api_addr, &args.metrics_addr, &data_dir.to_string_lossy(), &settings, args.dev);

    // --- 11. Serve until shutdown ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    tracing::info!("chally-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// init — Data directory initialization
// ---------------------------------------------------------------------------

/// Initializes a new node data directory:
///
/// ```text
/// {data_dir}/
///     db/         — ledger store
///     config/     — node configuration
/// ```
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("chally_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    let db_dir = data_dir.join("db");

    if db_dir.exists() && !args.force {
        anyhow::bail!(
            "data directory already initialized at {}. Use --force to re-initialize.",
            data_dir.display()
        );
    }

    let config_dir = data_dir.join("config");
    std::fs::create_dir_all(&db_dir)
        .with_context(|| format!("failed to create db directory: {}", db_dir.display()))?;
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create config directory: {}", config_dir.display()))?;

    // Open once so the trees exist and the store is known-good.
    let db = CoreDb::open(&db_dir)
        .with_context(|| format!("failed to open store at {}", db_dir.display()))?;
    db.flush().context("failed to flush new store")?;

    tracing::info!(data_dir = %data_dir.display(), "node initialized");

    println!();
    println!("Node initialized successfully.");
    println!();
    println!("  Data directory : {}", data_dir.display());
    println!("  Store          : {}", db_dir.display());
    println!();
    println!(
        "Run `chally-node run -d {}` to start the node.",
        data_dir.display()
    );

    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("chally-node {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit      {}", commit);
    }
    if let Some(ts) = option_env!("BUILD_TIMESTAMP") {
        println!("built       {}", ts);
    }
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the startup banner with the configuration summary.
fn print_startup_banner(
    api_addr: &str,
    metrics_addr: &str,
    data_dir: &str,
    settings: &Settings,
    dev: bool,
) {
    let mode = if dev { "Dev (ephemeral)" } else { "Production" };
    let withdraw = match settings.withdraw_mode {
        WithdrawMode::Refund => "refund",
        WithdrawMode::Disabled => "disabled",
    };

    let lines = [
        format!("API:        http://{api_addr}"),
        format!("Metrics:    http://{metrics_addr}/metrics"),
        format!("Data:       {data_dir}"),
        format!("Mode:       {mode}"),
        format!("Token:      {} cent(s)", settings.token_price_cents),
        format!("Daily cap:  {} tokens", settings.daily_deposit_cap_tokens),
        format!("Withdraw:   {withdraw}"),
    ];
    let title = format!("Chally — Financial Core Node v{}", env!("CARGO_PKG_VERSION"));

    let width = lines
        .iter()
        .map(|l| l.len())
        .chain(std::iter::once(title.len()))
        .max()
        .unwrap_or(40)
        + 4;
    let border = "\u{2550}".repeat(width);

    println!();
    println!("\u{2554}{border}\u{2557}");
    println!("\u{2551}  {title:<inner$}  \u{2551}", inner = width - 4);
    println!("\u{2560}{border}\u{2563}");
    for line in &lines {
        println!("\u{2551}  {line:<inner$}  \u{2551}", inner = width - 4);
    }
    println!("\u{255A}{border}\u{255D}");
    println!();
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_directory_structure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("chally-init-test");

        // Create the structure the same way init_node does.
        let db_dir = data_dir.join("db");
        let config_dir = data_dir.join("config");
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::create_dir_all(&config_dir).unwrap();

        let db = CoreDb::open(&db_dir).expect("open");
        db.flush().expect("flush");

        assert!(db_dir.exists());
        assert!(config_dir.exists());
    }

    #[test]
    fn startup_banner_does_not_panic() {
        print_startup_banner(
            "0.0.0.0:8180",
            "0.0.0.0:8181",
            "/var/lib/chally",
            &Settings::default(),
            true,
        );
    }

    #[test]
    fn dev_secret_is_nonempty() {
        assert!(!DEV_WEBHOOK_SECRET.is_empty());
    }
}
