//! Error types for the device manager

use crate::usb::Stage;
use thiserror::Error;
use transport::{DeviceKey, TransferStatus, TransportError};

/// Fatal startup errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("USB hotplug is not supported on this host")]
    HotplugUnsupported,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to spawn device manager thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why an arriving device did not enter identification
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Not for us; logged at debug level only
    #[error("{0}")]
    Skipped(&'static str),

    #[error("Could not get device descriptor: {0}")]
    Descriptor(TransportError),

    #[error("Could not open device: {0}")]
    Open(TransportError),

    #[error("Could not get configuration: {0}")]
    Configuration(TransportError),

    #[error("Could not set configuration {config}: {error}")]
    SetConfiguration { config: u8, error: TransportError },

    #[error("Could not find a suitable USB interface")]
    NoInterface,

    #[error("Could not claim interface {interface}: {error}")]
    Claim { interface: u8, error: TransportError },

    #[error("Could not request language ID: {0}")]
    Submit(TransportError),
}

/// Why identification of a device was rolled back
#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("{stage} transfer finished with status: {status}")]
    Transfer { stage: Stage, status: TransferStatus },

    #[error("Language ID descriptor too short ({0} bytes)")]
    ShortLangId(usize),

    #[error("Could not request serial number: {0}")]
    Submit(TransportError),

    #[error("Unexpected completion in stage {0}")]
    UnexpectedCompletion(Stage),

    #[error("Device manager is shutting down")]
    ShuttingDown,

    #[error("Failed to start any RX loop")]
    NoRxLoops,

    #[error("Multiplexer rejected device: {0}")]
    Rejected(#[from] MuxError),
}

/// Errors from an identified device's I/O path
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device is shutting down")]
    Dying,

    #[error("Failed to submit transfer: {0}")]
    Submit(TransportError),
}

/// Errors reported by a multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("Device {0} is already registered")]
    Duplicate(DeviceKey),

    #[error("Device {0} is not registered")]
    UnknownDevice(DeviceKey),

    #[error("Multiplexer is closed")]
    Closed,
}
