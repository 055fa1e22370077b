//! usbmuxd-rs
//!
//! Host-side USB device manager for Apple devices. Arriving devices are
//! probed, identified by their serial number over two asynchronous control
//! transfers, and handed to a [`Multiplexer`] with several bulk receive
//! loops already streaming.

pub mod config;
pub mod error;
pub mod mux;
pub mod usb;

pub use config::DaemonConfig;
pub use error::{DeviceError, IdentifyError, ManagerError, MuxError, ProbeError};
pub use mux::{DeviceRegistry, Multiplexer, RegistryEvent};
pub use usb::{DeviceManager, ManagerConfig, ManagerWorker, UsbDevice, spawn_device_manager};
