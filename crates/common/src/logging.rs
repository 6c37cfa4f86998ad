//! Logging utilities for labguard components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing with sensible defaults.
///
/// Uses the RUST_LOG environment variable to control log levels.
/// Default level is INFO.
pub fn init() {
    init_with_level("info");
}

/// Initialize tracing with JSON formatting (useful for structured logging).
pub fn init_json() {
    init_json_with_level("info");
}

/// Initialize human-readable tracing, falling back to `default_level` when
/// RUST_LOG is unset.
pub fn init_with_level(default_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(default_level))
        .init();
}

/// JSON variant of [`init_with_level`].
pub fn init_json_with_level(default_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter(default_level))
        .init();
}
