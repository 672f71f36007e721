//! Tracing subscriber setup for the CLI.
//!
//! Logs go to stderr so search results on stdout stay machine-readable.
//! `RUST_LOG` wins over the verbosity chosen on the command line.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Default filter directive for a verbosity level.
pub fn default_directive(debug: bool) -> String {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    format!("pqgraph={level},warn")
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init();
}
