//! Tracing setup

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Output always goes to stderr; in stdio
/// mode stdout carries protocol frames only, so ANSI colors are off too.
pub fn init_logging(stdio_mode: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!stdio_mode)
        .with_target(!stdio_mode)
        .try_init();
}
