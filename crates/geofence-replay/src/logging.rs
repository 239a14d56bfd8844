//! Logging setup for the replay binary
//!
//! Events go to stdout, so every log line is written to stderr.

use tracing_subscriber::prelude::*;

/// Initialize logging with sensible defaults
///
/// If `RUST_LOG` is not set, debug builds log at DEBUG for our crates and
/// release builds at INFO.
pub fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;

    if std::env::var("RUST_LOG").is_err() {
        // Safety: single-threaded at startup
        unsafe {
            if cfg!(debug_assertions) {
                std::env::set_var("RUST_LOG", "info,geofence_engine=debug,geofence_replay=debug");
            } else {
                std::env::set_var("RUST_LOG", "info");
            }
        }
    }

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());
    let registry = tracing_subscriber::registry().with(fmt_layer);
    if registry.try_init().is_err() {
        tracing::debug!("Logging was already initialized");
        return;
    }

    tracing::debug!("Logging initialized");
}
