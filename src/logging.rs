//! Logging setup.
//!
//! The engine logs through `tracing`: run and step milestones at `info`,
//! retries at `warn`, step failures at `error`, graph and plan internals at
//! `debug`. Each executor step runs inside a span carrying its resource id
//! and action.
//!
//! These helpers install a subscriber that writes to **stderr**, so stdout
//! stays free for plan output or machine-readable results.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `hemmer_engine=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Step-level progress (default)
//! RUST_LOG=info my-deployer apply
//!
//! # Graph, plan and retry detail from the engine only
//! RUST_LOG=warn,hemmer_engine=debug my-deployer apply
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the default logging subscriber.
///
/// Writes to stderr, honours `RUST_LOG` and defaults to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level, used when `RUST_LOG` is
/// not set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
///
/// # Example
///
/// ```no_run
/// hemmer_engine::init_logging_with_default("debug");
/// tracing::debug!("Planning");
/// ```
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(layer())
        .init();
}

/// Try to initialize logging, returning false if already initialized.
///
/// Unlike [`init_logging`], this does not panic when a subscriber is
/// already set, which makes it safe to call from tests.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(layer())
        .try_init()
        .is_ok()
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}
