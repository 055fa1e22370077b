//! Logging setup and configuration

use crate::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the daemon
///
/// `RUST_LOG` takes precedence over `default_level`. Thread names are shown
/// because completions run on the event pump and teardown threads.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| Error::LoggingInitialized(e.to_string()))
}

/// Send logs to the test harness's captured output
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_thread_names(true))
        .try_init();
}

fn parse_filter(level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|source| Error::LogFilter {
        filter: level.to_string(),
        source,
    })
}
