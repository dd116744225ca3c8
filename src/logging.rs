//! Tracing setup for the CLI.
//!
//! The `--log-level` flag selects the default verbosity; `RUST_LOG` takes
//! precedence when set so operators can scope filtering per target.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `level` is one of `DEBUG`, `INFO`, `WARNING`, `ERROR` (the CLI choices).
/// Output: stderr, compact format. Hook stdout/stderr are not routed through
/// tracing; children inherit the orchestrator's streams directly.
pub fn init(level: &str) {
    let fallback = match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
