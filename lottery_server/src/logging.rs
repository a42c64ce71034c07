// Log output setup for the server binary.
//
// Events are emitted with `tracing` throughout the crate using `action` and
// `result` fields. This module only installs the subscriber: `RUST_LOG` takes
// precedence, then the configured level, then `info`.

use tracing_subscriber::{EnvFilter, fmt};

/// Levels accepted by `--logging-level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Build the filter used by `init_logging`, without installing anything.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_logging(level: &str) {
    fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_thread_names(true)
        .init();
}

pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
}
