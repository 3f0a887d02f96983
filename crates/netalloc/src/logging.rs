//! Tracing subscriber setup.
//!
//! Allocation decisions log at debug, committed allocations at info, retries
//! and stale records at warn, and failed rollbacks at error. Address events
//! go to the `netalloc::events` target.

/// Initialize the tracing subscriber with JSON output.
///
/// `RUST_LOG` takes precedence over `log_level` when set.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();
}

/// Initialize logging with human-readable output, for development.
pub fn init_logging_pretty(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .init();
}
