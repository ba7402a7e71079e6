//! # Structured Logging
//!
//! Initializes the `tracing` subscriber with a configurable format
//! (pretty for terminals, JSON lines for log aggregation) and
//! environment-based filtering via `RUST_LOG`.
//!
//! Log output goes to stderr; stdout stays clean for CLI output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored output for local development.
    Pretty,
    /// Machine-parseable JSON lines for production aggregation.
    Json,
}

impl LogFormat {
    /// Parses a format string. Accepts `"json"` or `"pretty"`
    /// (case-insensitive); anything else falls back to `Pretty`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initializes the global tracing subscriber. Call exactly once, early
/// in `main()` — a second call panics.
///
/// `default_filter` applies when `RUST_LOG` is unset, e.g.
/// `"chally_node=info,chally_core=info"`. When set, `RUST_LOG` wins.
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true))
                .init();
        }
    }

    tracing::info!("logging initialized (format={:?})", format);
}
