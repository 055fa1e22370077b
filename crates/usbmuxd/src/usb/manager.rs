//! USB device manager
//!
//! Registers for Apple hotplug events, probes arriving devices and starts
//! their identification, and forwards departures to the multiplexer. The
//! manager never holds identified devices: once handed off they belong to
//! the multiplexer.

use crate::error::{ManagerError, ProbeError};
use crate::mux::Multiplexer;
use crate::usb::descriptors::{select_interface, speed_bps};
use crate::usb::device::{DeviceParts, UsbDevice};
use crate::usb::identify::{ConstructingGuard, Identification};
use crate::usb::{
    APPLE_VENDOR_ID, DEFAULT_RX_BUFFER_SIZE, DEFAULT_RX_LOOPS, FALLBACK_MAX_PACKET_SIZE,
    PRODUCT_ID_RANGE,
};
use common::{BroadcastEvent, GuardedSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transport::{
    DeviceKey, HotplugFilter, HotplugHandler, Transport, TransportDevice, TransportError,
    TransportHandle,
};

/// How long the pump keeps running after deregistration so torn-down
/// devices can finish their transfers
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Pause after an unexpected event-handling error
const EVENT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Device manager settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub vendor_id: u16,
    pub product_ids: RangeInclusive<u16>,
    /// Parallel receive loops per device
    pub rx_loops: usize,
    /// Buffer size of each receive transfer
    pub rx_buffer_size: usize,
}

impl ManagerConfig {
    /// Whether a device with these IDs should be identified
    pub fn accepts(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id && self.product_ids.contains(&product_id)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            vendor_id: APPLE_VENDOR_ID,
            product_ids: PRODUCT_ID_RANGE,
            rx_loops: DEFAULT_RX_LOOPS,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
        }
    }
}

/// State shared between the manager, its hotplug callback and every device
pub struct ManagerShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) mux: Arc<dyn Multiplexer>,
    /// Keys with identification in progress
    pub(crate) constructing: GuardedSet<DeviceKey>,
    pub(crate) config: ManagerConfig,
    /// One registration per `UsbDevice` alive
    pub(crate) live_devices: BroadcastEvent,
    dying: AtomicBool,
    stop: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// USB device manager
///
/// Creating it registers the hotplug callback, which reports devices that
/// are already attached as arrivals. [`DeviceManager::run`] pumps transport
/// events until [`DeviceManager::stop`] is requested. Dropping it
/// deregisters the callback and dispatches events on the dropping thread
/// until the departed devices are torn down, whether or not `run` was
/// ever called.
pub struct DeviceManager {
    shared: Arc<ManagerShared>,
}

impl DeviceManager {
    /// Create a device manager and register for hotplug events
    pub fn new(
        transport: Arc<dyn Transport>,
        mux: Arc<dyn Multiplexer>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        if !transport.has_hotplug() {
            return Err(ManagerError::HotplugUnsupported);
        }

        let filter = HotplugFilter {
            vendor_id: Some(config.vendor_id),
            product_id: None,
            enumerate: true,
        };

        let shared = Arc::new(ManagerShared {
            transport,
            mux,
            constructing: GuardedSet::new(),
            config,
            live_devices: BroadcastEvent::new(),
            dying: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let callback = HotplugCallback {
            shared: Arc::downgrade(&shared),
        };
        shared
            .transport
            .register_hotplug(filter, Box::new(callback))?;

        debug!("Hot-plug callbacks registered");
        Ok(Self { shared })
    }

    /// Pump transport events until stopped
    ///
    /// On exit the hotplug callback is deregistered, which reports every
    /// known device as departed, and events keep being dispatched for a
    /// short while so those devices can finish tearing down.
    pub fn run(&self) {
        info!("Device manager started");
        let transport = &self.shared.transport;

        while !self.shared.is_stopping() {
            self.pump_once();
        }

        info!("Device manager stopping");
        transport.deregister_hotplug();
        self.drain();
        info!("Device manager stopped");
    }

    /// Dispatch events until every device is gone or [`SHUTDOWN_DRAIN`]
    /// passes
    ///
    /// Teardown waits for cancelled transfers, whose completions only
    /// arrive through the dispatch.
    fn drain(&self) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while self.shared.live_devices.registered() > 0 && Instant::now() < deadline {
            self.pump_once();
        }

        let remaining = self.shared.live_devices.registered();
        if remaining > 0 {
            warn!("{} device(s) still alive at shutdown", remaining);
        }
    }

    fn pump_once(&self) {
        match self.shared.transport.handle_events() {
            Ok(()) => {}
            Err(TransportError::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_ERROR_BACKOFF);
            }
        }
    }

    /// Request the pump to exit; callable from any thread
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    /// Keys with identification in progress
    pub fn constructing(&self) -> Vec<DeviceKey> {
        self.shared.constructing.snapshot()
    }

    /// Number of `UsbDevice` values alive, identified or not
    pub fn live_devices(&self) -> usize {
        self.shared.live_devices.registered()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shared.dying.store(true, Ordering::Relaxed);
        self.shared.request_stop();
        self.shared.transport.deregister_hotplug();
        self.drain();
        debug!("Device manager released");
    }
}

/// Hotplug handler registered with the transport
///
/// Holds the shared state weakly: the transport owns the handler, and the
/// shared state owns the transport.
struct HotplugCallback {
    shared: Weak<ManagerShared>,
}

impl HotplugHandler for HotplugCallback {
    fn device_arrived(&mut self, device: Box<dyn TransportDevice>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let key = DeviceKey::new(device.bus_number(), device.address());

        super::guarded("hotplug arrival", key, || match probe(&shared, device.as_ref()) {
            Ok(()) => debug!("Identification of device {} started", key),
            Err(ProbeError::Skipped(reason)) => debug!("Skipping device {}: {}", key, reason),
            Err(e) => warn!("Failed to add device {}: {}", key, e),
        });
    }

    fn device_left(&mut self, device: Box<dyn TransportDevice>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let key = DeviceKey::new(device.bus_number(), device.address());

        super::guarded("hotplug departure", key, || {
            info!("Device {} left", key);
            shared.mux.delete_device_async(key.bus, key.address);
        });
    }
}

/// Inspect an arriving device and start its identification
///
/// Every resource acquired here is owned by a local until identification
/// takes it over, so any early return releases it.
fn probe(shared: &Arc<ManagerShared>, device: &dyn TransportDevice) -> Result<(), ProbeError> {
    let key = DeviceKey::new(device.bus_number(), device.address());

    if shared.is_dying() {
        return Err(ProbeError::Skipped("device manager is shutting down"));
    }
    if key.address == 0 {
        return Err(ProbeError::Skipped("device has no address yet"));
    }
    if shared.mux.have_device(key.bus, key.address) {
        return Err(ProbeError::Skipped("already known to the multiplexer"));
    }
    if shared.constructing.contains(&key) {
        return Err(ProbeError::Skipped("identification already in progress"));
    }

    let descriptor = device.device_descriptor().map_err(ProbeError::Descriptor)?;
    if descriptor.vendor_id != shared.config.vendor_id {
        return Err(ProbeError::Skipped("not an Apple device"));
    }
    if !shared.config.accepts(descriptor.vendor_id, descriptor.product_id) {
        return Err(ProbeError::Skipped("product ID outside the usbmux range"));
    }

    info!(
        "Found new device with v/p {:04x}:{:04x} at {}",
        descriptor.vendor_id, descriptor.product_id, key
    );

    // Nothing below may block: this runs inside the transport's dispatch
    let handle = device.open().map_err(ProbeError::Open)?;

    let current = handle
        .active_configuration()
        .map_err(ProbeError::Configuration)?;
    let wanted = descriptor.num_configurations;
    if current != wanted {
        detach_kernel_drivers(device, handle.as_ref(), key);
        info!(
            "Setting configuration for device {}, from {} to {}",
            key, current, wanted
        );
        handle
            .set_active_configuration(wanted)
            .map_err(|error| ProbeError::SetConfiguration {
                config: wanted,
                error,
            })?;
    }

    let config = device
        .active_config_descriptor()
        .map_err(ProbeError::Configuration)?;
    let selected = select_interface(&config, key).ok_or(ProbeError::NoInterface)?;

    handle
        .claim_interface(selected.interface)
        .map_err(|error| ProbeError::Claim {
            interface: selected.interface,
            error,
        })?;

    let max_packet_size = match device.max_packet_size(selected.ep_out) {
        Ok(size) if size > 0 => {
            info!("Using wMaxPacketSize={} for device {}", size, key);
            size
        }
        result => {
            warn!(
                "Could not determine wMaxPacketSize for device {} ({:?}), setting to {}",
                key, result, FALLBACK_MAX_PACKET_SIZE
            );
            FALLBACK_MAX_PACKET_SIZE
        }
    };

    let speed = speed_bps(device.speed());
    info!(
        "USB speed is {} MBit/s for device {}",
        speed as f64 / 1_000_000.0,
        key
    );

    let parts = DeviceParts {
        key,
        descriptor,
        interface: selected.interface,
        ep_in: selected.ep_in,
        ep_out: selected.ep_out,
        max_packet_size,
        speed,
        handle,
    };
    let device = UsbDevice::new(parts, Arc::clone(shared));
    let guard = ConstructingGuard::new(shared, key);

    Identification::start(device, guard).map_err(ProbeError::Submit)?;
    shared.constructing.insert(key);
    Ok(())
}

/// Detach kernel drivers from the interfaces of the current configuration
///
/// Best effort: failures are logged and the configuration change is still
/// attempted.
fn detach_kernel_drivers(device: &dyn TransportDevice, handle: &dyn TransportHandle, key: DeviceKey) {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            info!(
                "Could not get old configuration descriptor for device {}: {}",
                key, e
            );
            return;
        }
    };

    for intf in &config.interfaces {
        match handle.kernel_driver_active(intf.number) {
            Ok(true) => {
                info!(
                    "Detaching kernel driver for device {}, interface {}",
                    key, intf.number
                );
                if let Err(e) = handle.detach_kernel_driver(intf.number) {
                    warn!(
                        "Could not detach kernel driver ({}), configuration change will probably fail",
                        e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => info!(
                "Could not check kernel ownership of interface {} for device {}: {}",
                intf.number, key, e
            ),
        }
    }
}
