//! Structured logging with `tracing`.
//!
//! Call [`init_subscriber`] once at startup. `RUST_LOG` takes precedence over
//! the configured level so operators can raise verbosity without editing the
//! settings file.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for the stderr log writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Build the level filter, preferring `RUST_LOG` when it is set and valid.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with stderr output.
///
/// Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - Minimum level or filter directive (e.g. `"info"` or
///   `"beacon_server=debug,info"`).
/// * `format` - Compact text or JSON lines.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let filter = env_filter(level);

    // try_init is a no-op if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .try_init(),
    };
}
