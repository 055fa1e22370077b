//! The transport boundary
//!
//! The device manager is written against these traits only. A backend
//! provides enumeration, hotplug notification and asynchronous transfers;
//! all callbacks run on whichever thread is inside [`Transport::handle_events`].

use crate::error::{Result, SubmitError};
use crate::transfer::{CompletionFn, Transfer, TransferId};
use crate::types::{ConfigDescriptor, DeviceDescriptor, LinkSpeed};
use std::sync::Arc;

/// Hotplug registration filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Report already-attached devices as arrivals during registration
    pub enumerate: bool,
}

/// Receiver of hotplug notifications
///
/// Both methods run inside the transport's event dispatch and must not
/// block or panic.
pub trait HotplugHandler: Send {
    fn device_arrived(&mut self, device: Box<dyn TransportDevice>);
    fn device_left(&mut self, device: Box<dyn TransportDevice>);
}

/// A transport context
///
/// Creating the implementing value initializes the host stack; dropping it
/// shuts the stack down.
pub trait Transport: Send + Sync {
    /// Whether the host stack can deliver hotplug events
    fn has_hotplug(&self) -> bool;

    /// Register the (single) hotplug handler
    fn register_hotplug(
        &self,
        filter: HotplugFilter,
        handler: Box<dyn HotplugHandler>,
    ) -> Result<()>;

    /// Remove the hotplug handler
    ///
    /// Departures for devices the handler had been told about are reported
    /// before this returns or on the next dispatch.
    fn deregister_hotplug(&self);

    /// Dispatch pending events, blocking for a bounded time if there are none
    fn handle_events(&self) -> Result<()>;

    /// Currently attached devices
    fn devices(&self) -> Result<Vec<Box<dyn TransportDevice>>>;
}

/// An attached (not yet opened) device
pub trait TransportDevice: Send {
    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    fn device_descriptor(&self) -> Result<DeviceDescriptor>;

    fn active_config_descriptor(&self) -> Result<ConfigDescriptor>;

    fn speed(&self) -> LinkSpeed;

    /// wMaxPacketSize of `endpoint` in the active configuration
    fn max_packet_size(&self, endpoint: u8) -> Result<u16>;

    /// Open the device; the handle closes when the last reference drops
    fn open(&self) -> Result<Arc<dyn TransportHandle>>;
}

/// An opened device
pub trait TransportHandle: Send + Sync {
    fn active_configuration(&self) -> Result<u8>;

    fn set_active_configuration(&self, config: u8) -> Result<()>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<()>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Submit a transfer
    ///
    /// On `Ok`, `on_complete` is called exactly once, from the event
    /// dispatch, with the transfer and its terminal status. On `Err` the
    /// transfer comes back in the error and `on_complete` is dropped
    /// without being called.
    fn submit(
        &self,
        transfer: Transfer,
        on_complete: CompletionFn,
    ) -> std::result::Result<(), SubmitError>;

    /// Request cancellation of an in-flight transfer
    ///
    /// The transfer still completes through its callback, normally with
    /// `TransferStatus::Cancelled`.
    fn cancel(&self, id: TransferId) -> Result<()>;
}
