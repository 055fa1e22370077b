//! Transport error types

use crate::transfer::Transfer;
use thiserror::Error;

/// Errors reported by a transport backend
///
/// These mirror the failure classes of a libusb-style host stack. A backend
/// that cannot classify a failure uses [`TransportError::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Input/output error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("System call interrupted")]
    Interrupted,

    #[error("Insufficient memory")]
    NoMem,

    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,

    #[error("Transport error: {0}")]
    Other(String),
}

/// A submission the transport refused
///
/// The transfer is handed back so the caller decides whether to retry it or
/// drop it; the completion callback passed to `submit` is never invoked.
#[derive(Debug, Error)]
#[error("Failed to submit transfer {}: {error}", .transfer.id())]
pub struct SubmitError {
    pub error: TransportError,
    pub transfer: Transfer,
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, TransportError>;
