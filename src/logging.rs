/// Tracing setup for the binary entry point.
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v`/`-q` pick the fallback level,
/// then the configured filter. Returns quietly if a subscriber is already
/// installed, so logging setup can never take the process down.
pub fn init(verbose: bool, quiet: bool, config_filter: &str) {
    let fallback = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        config_filter
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();
}
