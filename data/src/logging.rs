//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber which writes formatted events to stderr.
///
/// The subscriber is filtered by the `RUST_LOG` environment variable, defaulting to `info`. It is
/// safe to call this function more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
