//! USB transport boundary for usbmuxd-rs
//!
//! This crate defines what the device manager needs from a USB host stack:
//! device enumeration, hotplug notification, descriptor access, and
//! asynchronous control/bulk transfers whose completion callback runs
//! exactly once. The manager never talks to libusb directly.
//!
//! # Example
//!
//! ```
//! use transport::{ControlSetup, Transfer, CONTROL_SETUP_SIZE};
//! use std::time::Duration;
//!
//! // Request the language ID table (string descriptor 0)
//! let setup = ControlSetup::get_string_descriptor(0, 0, 1024);
//! let transfer = Transfer::control(setup, Some(Duration::from_millis(1000)));
//!
//! assert_eq!(transfer.buffer().len(), CONTROL_SETUP_SIZE + 1024);
//! assert_eq!(transfer.control_setup(), Some(setup));
//! ```
//!
//! # Backends
//!
//! With the default `libusb` feature, [`LibusbTransport`] implements the
//! boundary on top of `rusb`.

pub mod error;
#[cfg(feature = "libusb")]
pub mod libusb;
pub mod traits;
pub mod transfer;
pub mod types;

pub use error::{Result, SubmitError, TransportError};
#[cfg(feature = "libusb")]
pub use libusb::LibusbTransport;
pub use traits::{HotplugFilter, HotplugHandler, Transport, TransportDevice, TransportHandle};
pub use transfer::{
    CONTROL_SETUP_SIZE, CompletionFn, ControlSetup, DESCRIPTOR_TYPE_STRING, ENDPOINT_IN,
    REQUEST_GET_DESCRIPTOR, Transfer, TransferId, TransferKind, TransferStatus,
};
pub use types::{
    ConfigDescriptor, DeviceDescriptor, DeviceKey, Direction, EndpointDescriptor, EndpointKind,
    InterfaceDescriptor, LinkSpeed,
};
