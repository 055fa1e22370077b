//! USB subsystem
//!
//! Turns hotplug arrivals of Apple devices into identified, streaming
//! [`UsbDevice`]s and hands them to the multiplexer.
//!
//! - `manager`: hotplug registration, probing, the event pump
//! - `identify`: the asynchronous language ID / serial number chain
//! - `receive`: continuous bulk IN loops
//! - `device`: the identified device, its send path and teardown
//! - `descriptors`: interface selection, speed mapping, serial decoding
//!
//! All hotplug and completion callbacks run on the thread driving
//! [`DeviceManager::run`], which lives on a dedicated worker thread beside
//! the async runtime.

use std::ops::RangeInclusive;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::error;
use transport::DeviceKey;

pub mod descriptors;
pub mod device;
pub mod identify;
pub mod manager;
pub mod receive;
pub mod worker;

pub use descriptors::{SelectedInterface, SerialNumber, select_interface, speed_bps};
pub use device::UsbDevice;
pub use identify::Stage;
pub use manager::{DeviceManager, ManagerConfig};
pub use worker::{ManagerWorker, spawn_device_manager};

/// Apple Inc.
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// Product IDs that speak usbmux
pub const PRODUCT_ID_RANGE: RangeInclusive<u16> = 0x1290..=0x12af;

pub const INTERFACE_CLASS: u8 = 0xff;
pub const INTERFACE_SUBCLASS: u8 = 0xfe;
pub const INTERFACE_PROTOCOL: u8 = 2;

/// Endpoints on the usbmux interface: one bulk IN, one bulk OUT
pub const INTERFACE_ENDPOINTS: usize = 2;

/// Receive buffer per RX transfer
pub const DEFAULT_RX_BUFFER_SIZE: usize = 16 * 1024;

/// Parallel receive loops per device
pub const DEFAULT_RX_LOOPS: usize = 3;

/// Data area of the identification control transfer
pub const CONTROL_BUFFER_SIZE: u16 = 1024;

pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Used when the OUT endpoint's wMaxPacketSize cannot be read
pub const FALLBACK_MAX_PACKET_SIZE: u16 = 64;

/// Run a transport callback body, keeping panics out of the dispatch loop
pub(crate) fn guarded(what: &str, key: DeviceKey, body: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(body)).is_err() {
        error!("Panic in {} for device {}", what, key);
    }
}
