//! Shared fixtures for device manager integration tests
//!
//! Tests drive the event pump themselves through
//! [`MockTransport::pump_until`], so every callback runs on the test thread
//! except device teardown.

#![allow(dead_code)]

use async_channel::Receiver;
use common::setup_test_logging;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockDeviceSpec, MockTransport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use transport::{DeviceKey, TransferKind};
use usbmuxd::{
    DeviceManager, DeviceRegistry, ManagerConfig, Multiplexer, MuxError, RegistryEvent, UsbDevice,
};

pub const EVENT_CAPACITY: usize = 1024;

/// Mock transport + registry + manager
pub struct Harness {
    pub transport: MockTransport,
    pub registry: Arc<DeviceRegistry>,
    pub events: Receiver<RegistryEvent>,
    pub manager: DeviceManager,
}

impl Harness {
    /// Attach `devices`, then start a manager that enumerates them
    pub fn new(devices: Vec<MockDeviceSpec>) -> Self {
        Self::with_config(devices, ManagerConfig::default())
    }

    pub fn with_config(devices: Vec<MockDeviceSpec>, config: ManagerConfig) -> Self {
        setup_test_logging();
        let transport = MockTransport::new();
        for spec in devices {
            transport.attach(spec);
        }

        let (registry, events) = DeviceRegistry::new(EVENT_CAPACITY);
        let registry = Arc::new(registry);
        let manager = DeviceManager::new(Arc::new(transport.clone()), registry.clone(), config)
            .expect("manager should start");

        Self {
            transport,
            registry,
            events,
            manager,
        }
    }

    pub fn pump_until(&self, condition: impl FnMut() -> bool) -> bool {
        self.transport.pump_until(DEFAULT_TEST_TIMEOUT, condition)
    }

    /// Pump until `key` is registered and return it
    pub fn handed_off(&self, key: DeviceKey) -> Arc<UsbDevice> {
        assert!(
            self.pump_until(|| self.registry.device(key).is_some()),
            "device {} was never handed off",
            key
        );
        self.registry.device(key).unwrap()
    }

    /// Pump until nothing from identification or teardown is left
    pub fn settle(&self) -> bool {
        self.pump_until(|| self.manager.live_devices() == 0 && self.manager.constructing().is_empty())
    }

    pub fn drain_events(&self) -> Vec<RegistryEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

/// Distinct transfers submitted to a device for one kind of transfer
pub fn distinct_submits(transport: &MockTransport, key: DeviceKey, kind: TransferKind) -> usize {
    transport
        .log()
        .submits
        .iter()
        .filter(|(k, _, kd)| *k == key && *kd == kind)
        .map(|(_, id, _)| *id)
        .collect::<HashSet<_>>()
        .len()
}

/// Multiplexer that records every call
#[derive(Default)]
pub struct RecordingMux {
    pub known: Mutex<HashSet<DeviceKey>>,
    pub added: Mutex<Vec<Arc<UsbDevice>>>,
    pub deleted: Mutex<Vec<DeviceKey>>,
    pub data: Mutex<Vec<(DeviceKey, usize)>>,
    pub reject: AtomicBool,
}

impl RecordingMux {
    pub fn rejecting() -> Self {
        let mux = Self::default();
        mux.reject.store(true, Ordering::Relaxed);
        mux
    }

    pub fn added_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    pub fn deleted(&self) -> Vec<DeviceKey> {
        self.deleted.lock().unwrap().clone()
    }

    /// Drop the devices this mux accepted
    pub fn clear(&self) {
        self.added.lock().unwrap().clear();
    }
}

impl Multiplexer for RecordingMux {
    fn have_device(&self, bus: u8, address: u8) -> bool {
        self.known
            .lock()
            .unwrap()
            .contains(&DeviceKey::new(bus, address))
    }

    fn delete_device_async(&self, bus: u8, address: u8) {
        self.deleted
            .lock()
            .unwrap()
            .push(DeviceKey::new(bus, address));
    }

    fn add_device(&self, device: Arc<UsbDevice>) -> Result<(), MuxError> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(MuxError::Duplicate(device.key()));
        }
        self.added.lock().unwrap().push(device);
        Ok(())
    }

    fn device_data_input(&self, device: &UsbDevice, data: &[u8]) -> Result<(), MuxError> {
        self.data.lock().unwrap().push((device.key(), data.len()));
        Ok(())
    }
}
