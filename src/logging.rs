//! Tracing subscriber setup for embedding binaries.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `verbose` raises this crate's level to debug. A `RUST_LOG`
/// environment variable takes precedence over both presets.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let preset = if verbose {
        "relay=debug,info"
    } else {
        "relay=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(preset));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}
