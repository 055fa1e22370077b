//! Common error types

use thiserror::Error;
use tracing_subscriber::filter::ParseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log filter '{filter}': {source}")]
    LogFilter {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("Logging already initialized: {0}")]
    LoggingInitialized(String),
}

pub type Result<T> = std::result::Result<T, Error>;
