//! Multiplexer contract and a minimal device registry
//!
//! The device manager hands identified devices to a [`Multiplexer`] and
//! reports departures to it. [`DeviceRegistry`] is the implementation the
//! daemon ships: it keeps handed-off devices, accounts received bytes and
//! publishes lifecycle events to the async side over a channel.

use crate::error::MuxError;
use crate::usb::UsbDevice;
use async_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};
use transport::DeviceKey;

/// Consumer of identified devices
///
/// Called from the transport's event dispatch (and from device teardown
/// threads for `delete_device_async`); implementations should return
/// promptly.
pub trait Multiplexer: Send + Sync {
    /// Whether a device at this bus position is already known
    fn have_device(&self, bus: u8, address: u8) -> bool;

    /// Forget the device at this bus position and tear it down
    fn delete_device_async(&self, bus: u8, address: u8);

    /// Take ownership of a newly identified device
    ///
    /// Rejecting it rolls the identification back.
    fn add_device(&self, device: Arc<UsbDevice>) -> Result<(), MuxError>;

    /// Bytes received on the device's IN endpoint
    fn device_data_input(&self, device: &UsbDevice, data: &[u8]) -> Result<(), MuxError>;
}

/// Events published by [`DeviceRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceAdded {
        key: DeviceKey,
        product_id: u16,
        serial: String,
        speed: u64,
    },
    DeviceRemoved {
        key: DeviceKey,
        serial: String,
    },
    DataReceived {
        key: DeviceKey,
        bytes: usize,
    },
}

struct Entry {
    device: Arc<UsbDevice>,
    rx_bytes: u64,
}

/// Registry of handed-off devices
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceKey, Entry>>,
    events: Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a registry whose event channel holds up to `capacity` events
    ///
    /// Lifecycle events wait for room; data events are dropped when the
    /// channel is full.
    pub fn new(capacity: usize) -> (Self, Receiver<RegistryEvent>) {
        let (events, rx) = async_channel::bounded(capacity);
        let registry = Self {
            devices: Mutex::new(HashMap::new()),
            events,
        };
        (registry, rx)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceKey, Entry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }

    pub fn device(&self, key: DeviceKey) -> Option<Arc<UsbDevice>> {
        self.devices().get(&key).map(|e| Arc::clone(&e.device))
    }

    /// Registered devices, ordered by bus position
    pub fn list(&self) -> Vec<Arc<UsbDevice>> {
        let mut devices: Vec<_> = self
            .devices()
            .values()
            .map(|e| Arc::clone(&e.device))
            .collect();
        devices.sort_by_key(|d| d.key());
        devices
    }

    /// Bytes received from a registered device
    pub fn rx_bytes(&self, key: DeviceKey) -> Option<u64> {
        self.devices().get(&key).map(|e| e.rx_bytes)
    }

    fn publish(&self, event: RegistryEvent) {
        if let Err(e) = self.events.send_blocking(event) {
            debug!("Registry event dropped, no listener: {:?}", e.into_inner());
        }
    }
}

impl Multiplexer for DeviceRegistry {
    fn have_device(&self, bus: u8, address: u8) -> bool {
        self.devices().contains_key(&DeviceKey::new(bus, address))
    }

    fn delete_device_async(&self, bus: u8, address: u8) {
        let key = DeviceKey::new(bus, address);
        let Some(entry) = self.devices().remove(&key) else {
            return;
        };

        info!(
            "Removed device {} ({}), {} bytes received",
            key,
            entry.device.serial(),
            entry.rx_bytes
        );
        entry.device.kill();
        self.publish(RegistryEvent::DeviceRemoved {
            key,
            serial: entry.device.serial().to_string(),
        });
    }

    fn add_device(&self, device: Arc<UsbDevice>) -> Result<(), MuxError> {
        let key = device.key();
        let event = RegistryEvent::DeviceAdded {
            key,
            product_id: device.product_id(),
            serial: device.serial().to_string(),
            speed: device.speed(),
        };

        {
            let mut devices = self.devices();
            if devices.contains_key(&key) {
                return Err(MuxError::Duplicate(key));
            }
            devices.insert(
                key,
                Entry {
                    device,
                    rx_bytes: 0,
                },
            );
        }

        info!("Added device {}", key);
        self.publish(event);
        Ok(())
    }

    fn device_data_input(&self, device: &UsbDevice, data: &[u8]) -> Result<(), MuxError> {
        let key = device.key();
        {
            let mut devices = self.devices();
            let entry = devices.get_mut(&key).ok_or(MuxError::UnknownDevice(key))?;
            entry.rx_bytes += data.len() as u64;
        }

        trace!("Device {} delivered {} bytes", key, data.len());
        let event = RegistryEvent::DataReceived {
            key,
            bytes: data.len(),
        };
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("Event channel full, data event for {} dropped", key);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(MuxError::Closed),
        }
    }
}
