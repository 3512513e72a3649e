//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::{LedgerConfig, LogFormat};

/// Initialize tracing for the process.
///
/// `RUST_LOG` wins over the configured level. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init_tracing(config: &LedgerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };
}
