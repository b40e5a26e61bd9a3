//! Structured logging initialization.
//!
//! Thin helper over the tracing subscriber for embedders and examples.
//! The RUST_LOG environment variable takes precedence over the level passed
//! in, so a deployed binary can always be re-leveled without a rebuild.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// `level` is a tracing filter directive such as `"info"` or
/// `"muxio=trace"`. Calling this twice is an error at the subscriber level;
/// embedders that install their own subscriber should skip this entirely.
pub fn init(level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .init();
}
