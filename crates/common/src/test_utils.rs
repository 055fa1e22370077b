//! Test utilities for usbmuxd-rs
//!
//! Provides a scriptable in-memory [`Transport`] and helpers for building
//! mock Apple devices.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockDeviceBuilder, MockTransport};
//! use transport::Transport;
//!
//! let transport = MockTransport::new();
//! transport.attach(MockDeviceBuilder::apple(1, 4).build());
//!
//! assert!(transport.has_hotplug());
//! assert_eq!(transport.devices().unwrap().len(), 1);
//! ```
//!
//! `handle_events` behaves like a transport event pump: it delivers queued
//! hotplug events, then completes every transfer that is ready. Control
//! string-descriptor requests complete automatically from the device
//! script; bulk IN transfers stay pending until the test completes them with
//! [`MockTransport::complete_bulk_in`] or cancels them. Bulk OUT transfers
//! complete right away unless the device holds them
//! ([`MockDeviceBuilder::hold_bulk_out`]).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use transport::{
    CONTROL_SETUP_SIZE, CompletionFn, ConfigDescriptor, DeviceDescriptor, DeviceKey,
    EndpointDescriptor, EndpointKind, HotplugFilter, HotplugHandler, InterfaceDescriptor,
    LinkSpeed, SubmitError, Transfer, TransferId, TransferKind, TransferStatus, Transport,
    TransportDevice, TransportError, TransportHandle,
};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Apple's USB vendor ID
pub const MOCK_APPLE_VENDOR_ID: u16 = 0x05ac;

/// A product ID inside the usbmux range
pub const MOCK_APPLE_PRODUCT_ID: u16 = 0x12a8;

/// A 24-character legacy serial
pub const MOCK_SERIAL: &str = "00008030001A35E22EF8802E";

/// Everything the mock knows about one attached device
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub key: DeviceKey,
    pub descriptor: DeviceDescriptor,
    pub config: ConfigDescriptor,
    pub current_configuration: u8,
    pub speed: LinkSpeed,
    pub max_packet_size: Option<u16>,
    pub kernel_driver_interfaces: Vec<u8>,
    pub lang_id: u16,
    pub serial: Vec<u16>,
    pub langid_status: TransferStatus,
    pub serial_status: TransferStatus,
    pub open_error: Option<TransportError>,
    pub claim_error: Option<TransportError>,
    /// Number of bulk IN submissions that fail before one succeeds
    pub bulk_in_submit_failures: usize,
    /// Keep bulk OUT transfers pending until completed or cancelled
    pub hold_bulk_out: bool,
}

/// Builder for [`MockDeviceSpec`]
#[derive(Debug, Clone)]
pub struct MockDeviceBuilder {
    spec: MockDeviceSpec,
}

impl MockDeviceBuilder {
    /// An Apple device with a PTP interface followed by the usbmux interface
    /// (endpoints OUT 0x02, IN 0x81)
    pub fn apple(bus: u8, address: u8) -> Self {
        Self {
            spec: MockDeviceSpec {
                key: DeviceKey::new(bus, address),
                descriptor: DeviceDescriptor {
                    vendor_id: MOCK_APPLE_VENDOR_ID,
                    product_id: MOCK_APPLE_PRODUCT_ID,
                    class_code: 0,
                    sub_class_code: 0,
                    protocol_code: 0,
                    num_configurations: 4,
                    serial_number_index: 3,
                },
                config: ConfigDescriptor {
                    number: 4,
                    interfaces: vec![
                        create_mock_interface(0, (0x06, 0x01, 0x01), &[0x83, 0x04]),
                        create_mock_interface(1, (0xff, 0xfe, 0x02), &[0x02, 0x81]),
                    ],
                },
                current_configuration: 4,
                speed: LinkSpeed::High,
                max_packet_size: Some(512),
                kernel_driver_interfaces: Vec::new(),
                lang_id: 0x0409,
                serial: MOCK_SERIAL.encode_utf16().collect(),
                langid_status: TransferStatus::Completed,
                serial_status: TransferStatus::Completed,
                open_error: None,
                claim_error: None,
                bulk_in_submit_failures: 0,
                hold_bulk_out: false,
            },
        }
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.spec.descriptor.vendor_id = vendor_id;
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.spec.descriptor.product_id = product_id;
        self
    }

    pub fn num_configurations(mut self, count: u8) -> Self {
        self.spec.descriptor.num_configurations = count;
        self
    }

    pub fn current_configuration(mut self, config: u8) -> Self {
        self.spec.current_configuration = config;
        self
    }

    pub fn interfaces(mut self, interfaces: Vec<InterfaceDescriptor>) -> Self {
        self.spec.config.interfaces = interfaces;
        self
    }

    pub fn speed(mut self, speed: LinkSpeed) -> Self {
        self.spec.speed = speed;
        self
    }

    pub fn max_packet_size(mut self, size: Option<u16>) -> Self {
        self.spec.max_packet_size = size;
        self
    }

    pub fn kernel_driver_on(mut self, interface: u8) -> Self {
        self.spec.kernel_driver_interfaces.push(interface);
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.spec.serial = serial.encode_utf16().collect();
        self
    }

    pub fn serial_units(mut self, units: Vec<u16>) -> Self {
        self.spec.serial = units;
        self
    }

    pub fn langid_status(mut self, status: TransferStatus) -> Self {
        self.spec.langid_status = status;
        self
    }

    pub fn serial_status(mut self, status: TransferStatus) -> Self {
        self.spec.serial_status = status;
        self
    }

    pub fn open_error(mut self, error: TransportError) -> Self {
        self.spec.open_error = Some(error);
        self
    }

    pub fn claim_error(mut self, error: TransportError) -> Self {
        self.spec.claim_error = Some(error);
        self
    }

    pub fn bulk_in_submit_failures(mut self, count: usize) -> Self {
        self.spec.bulk_in_submit_failures = count;
        self
    }

    pub fn hold_bulk_out(mut self) -> Self {
        self.spec.hold_bulk_out = true;
        self
    }

    pub fn build(self) -> MockDeviceSpec {
        self.spec
    }
}

/// Interface descriptor with bulk endpoints at the given addresses
pub fn create_mock_interface(
    number: u8,
    (class, subclass, protocol): (u8, u8, u8),
    endpoints: &[u8],
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        class_code: class,
        sub_class_code: subclass,
        protocol_code: protocol,
        endpoints: endpoints.iter().map(|&a| create_mock_bulk_endpoint(a)).collect(),
    }
}

/// Bulk endpoint descriptor with a 512-byte max packet size
pub fn create_mock_bulk_endpoint(address: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        kind: EndpointKind::Bulk,
        max_packet_size: 512,
    }
}

/// String descriptor bytes (bLength, bDescriptorType, UTF-16LE units)
pub fn create_mock_string_descriptor(units: &[u16]) -> Vec<u8> {
    let len = (2 + units.len() * 2).min(255);
    let mut desc = Vec::with_capacity(len);
    desc.push(len as u8);
    desc.push(0x03);
    for unit in units {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    desc.truncate(len);
    desc
}

/// Things the mock observed, for assertions
#[derive(Debug, Default, Clone)]
pub struct MockLog {
    /// Every submission, including resubmissions of the same transfer
    pub submits: Vec<(DeviceKey, TransferId, TransferKind)>,
    pub cancels: Vec<TransferId>,
    /// Transfers whose completion did not resubmit them, in delivery order
    pub freed: Vec<TransferId>,
    pub set_configurations: Vec<(DeviceKey, u8)>,
    pub detached_drivers: Vec<(DeviceKey, u8)>,
    pub claimed_interfaces: Vec<(DeviceKey, u8)>,
    pub opened: usize,
    pub closed: usize,
}

struct Ready {
    transfer: Transfer,
    on_complete: CompletionFn,
    status: TransferStatus,
}

struct Pending {
    key: DeviceKey,
    transfer: Transfer,
    on_complete: CompletionFn,
}

enum HotplugEvent {
    Arrived(MockDeviceSpec),
    Left(MockDeviceSpec),
}

#[derive(Default)]
struct MockState {
    attached: Vec<MockDeviceSpec>,
    configurations: HashMap<DeviceKey, u8>,
    bulk_in_failures: HashMap<DeviceKey, usize>,
    hotplug_queue: VecDeque<HotplugEvent>,
    ready: VecDeque<Ready>,
    pending_in: Vec<Pending>,
    pending_out: Vec<Pending>,
    before_bulk_out: Option<Box<dyn FnOnce() + Send>>,
    log: MockLog,
    registered: bool,
}

impl MockState {
    /// Whether `id` is pending or has a completion queued
    fn holds(&self, id: TransferId) -> bool {
        self.pending_in.iter().any(|p| p.transfer.id() == id)
            || self.pending_out.iter().any(|p| p.transfer.id() == id)
            || self.ready.iter().any(|r| r.transfer.id() == id)
    }
}

struct MockShared {
    state: Mutex<MockState>,
    handler: Mutex<Option<Box<dyn HotplugHandler>>>,
    hotplug_supported: AtomicBool,
}

impl MockShared {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> MutexGuard<'_, Option<Box<dyn HotplugHandler>>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scriptable in-memory transport
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState::default()),
                handler: Mutex::new(None),
                hotplug_supported: AtomicBool::new(true),
            }),
        }
    }

    /// A transport whose host stack cannot deliver hotplug events
    pub fn without_hotplug() -> Self {
        let transport = Self::new();
        transport
            .shared
            .hotplug_supported
            .store(false, Ordering::Relaxed);
        transport
    }

    /// Plug a device in; reported on the next `handle_events`
    pub fn attach(&self, spec: MockDeviceSpec) {
        let mut state = self.shared.state();
        state
            .configurations
            .insert(spec.key, spec.current_configuration);
        state
            .bulk_in_failures
            .insert(spec.key, spec.bulk_in_submit_failures);
        state.attached.retain(|d| d.key != spec.key);
        state.attached.push(spec.clone());
        if state.registered {
            state.hotplug_queue.push_back(HotplugEvent::Arrived(spec));
        }
    }

    /// Unplug a device; pending bulk transfers complete with NoDevice
    pub fn detach(&self, key: DeviceKey) {
        let mut state = self.shared.state();
        let Some(pos) = state.attached.iter().position(|d| d.key == key) else {
            return;
        };
        let spec = state.attached.remove(pos);

        let state = &mut *state;
        let mut gone = Vec::new();
        for queue in [&mut state.pending_in, &mut state.pending_out] {
            let (matching, kept): (Vec<_>, Vec<_>) =
                std::mem::take(queue).into_iter().partition(|p| p.key == key);
            *queue = kept;
            gone.extend(matching);
        }
        for pending in gone {
            state.ready.push_back(Ready {
                transfer: pending.transfer,
                on_complete: pending.on_complete,
                status: TransferStatus::NoDevice,
            });
        }

        if state.registered {
            state.hotplug_queue.push_back(HotplugEvent::Left(spec));
        }
    }

    /// Complete a pending bulk IN transfer with `status` and `data`
    ///
    /// Returns false if no such transfer is pending.
    pub fn complete_bulk_in(&self, id: TransferId, status: TransferStatus, data: &[u8]) -> bool {
        let mut state = self.shared.state();
        let Some(pos) = state.pending_in.iter().position(|p| p.transfer.id() == id) else {
            return false;
        };
        let Pending {
            mut transfer,
            on_complete,
            ..
        } = state.pending_in.remove(pos);

        let len = data.len().min(transfer.data_capacity());
        transfer.buffer_mut()[..len].copy_from_slice(&data[..len]);
        transfer.set_actual_length(len);
        state.ready.push_back(Ready {
            transfer,
            on_complete,
            status,
        });
        true
    }

    /// Bulk IN transfers currently waiting for data
    pub fn pending_bulk_in(&self) -> Vec<TransferId> {
        self.shared
            .state()
            .pending_in
            .iter()
            .map(|p| p.transfer.id())
            .collect()
    }

    /// Bulk IN transfers pending for one device
    pub fn pending_bulk_in_for(&self, key: DeviceKey) -> Vec<TransferId> {
        self.shared
            .state()
            .pending_in
            .iter()
            .filter(|p| p.key == key)
            .map(|p| p.transfer.id())
            .collect()
    }

    /// Run `hook` at the start of the next bulk OUT submission, before the
    /// transfer reaches the transport's queues
    pub fn before_next_bulk_out(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.state().before_bulk_out = Some(Box::new(hook));
    }

    /// Held bulk OUT transfers for one device
    pub fn pending_bulk_out_for(&self, key: DeviceKey) -> Vec<TransferId> {
        self.shared
            .state()
            .pending_out
            .iter()
            .filter(|p| p.key == key)
            .map(|p| p.transfer.id())
            .collect()
    }

    /// Complete a held bulk OUT transfer with `status`
    ///
    /// Returns false if no such transfer is held.
    pub fn complete_bulk_out(&self, id: TransferId, status: TransferStatus) -> bool {
        let mut state = self.shared.state();
        let Some(pos) = state.pending_out.iter().position(|p| p.transfer.id() == id) else {
            return false;
        };
        let Pending {
            mut transfer,
            on_complete,
            ..
        } = state.pending_out.remove(pos);

        if status == TransferStatus::Completed {
            let len = transfer.buffer().len();
            transfer.set_actual_length(len);
        }
        state.ready.push_back(Ready {
            transfer,
            on_complete,
            status,
        });
        true
    }

    /// Transfers whose completion is queued but not yet delivered
    pub fn ready_count(&self) -> usize {
        self.shared.state().ready.len()
    }

    pub fn configuration_of(&self, key: DeviceKey) -> Option<u8> {
        self.shared.state().configurations.get(&key).copied()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.state().registered
    }

    pub fn log(&self) -> MockLog {
        self.shared.state().log.clone()
    }

    /// Run `handle_events` until `condition` holds or `timeout` elapses
    pub fn pump_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let _ = self.handle_events();
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    fn dispatch_hotplug(&self) -> bool {
        let mut dispatched = false;
        loop {
            let event = self.shared.state().hotplug_queue.pop_front();
            let Some(event) = event else {
                return dispatched;
            };
            dispatched = true;

            let mut handler = self.shared.handler();
            if let Some(handler) = handler.as_mut() {
                match event {
                    HotplugEvent::Arrived(spec) => handler.device_arrived(self.device(spec)),
                    HotplugEvent::Left(spec) => handler.device_left(self.device(spec)),
                }
            }
        }
    }

    fn dispatch_completions(&self) -> bool {
        let mut dispatched = false;
        loop {
            let ready = self.shared.state().ready.pop_front();
            let Some(ready) = ready else {
                return dispatched;
            };
            dispatched = true;

            let id = ready.transfer.id();
            (ready.on_complete)(ready.transfer, ready.status);

            let mut state = self.shared.state();
            if !state.holds(id) {
                state.log.freed.push(id);
            }
        }
    }

    fn device(&self, spec: MockDeviceSpec) -> Box<dyn TransportDevice> {
        Box::new(MockDevice {
            spec: Arc::new(spec),
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn has_hotplug(&self) -> bool {
        self.shared.hotplug_supported.load(Ordering::Relaxed)
    }

    fn register_hotplug(
        &self,
        filter: HotplugFilter,
        handler: Box<dyn HotplugHandler>,
    ) -> transport::Result<()> {
        if !self.has_hotplug() {
            return Err(TransportError::NotSupported);
        }

        let existing = {
            let mut state = self.shared.state();
            state.registered = true;
            state.attached.clone()
        };

        let mut slot = self.shared.handler();
        let handler = slot.insert(handler);
        if filter.enumerate {
            // libusb reports already-attached devices during registration
            for spec in existing {
                if filter.vendor_id.is_none_or(|v| v == spec.descriptor.vendor_id) {
                    handler.device_arrived(self.device(spec));
                }
            }
        }
        Ok(())
    }

    fn deregister_hotplug(&self) {
        let attached = {
            let mut state = self.shared.state();
            if !state.registered {
                return;
            }
            state.registered = false;
            state.hotplug_queue.clear();
            state.attached.clone()
        };

        let handler = self.shared.handler().take();
        if let Some(mut handler) = handler {
            for spec in attached {
                handler.device_left(self.device(spec));
            }
        }
    }

    fn handle_events(&self) -> transport::Result<()> {
        let hotplug = self.dispatch_hotplug();
        let completions = self.dispatch_completions();
        if !hotplug && !completions {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn devices(&self) -> transport::Result<Vec<Box<dyn TransportDevice>>> {
        let attached = self.shared.state().attached.clone();
        Ok(attached.into_iter().map(|spec| self.device(spec)).collect())
    }
}

struct MockDevice {
    spec: Arc<MockDeviceSpec>,
    shared: Arc<MockShared>,
}

impl TransportDevice for MockDevice {
    fn bus_number(&self) -> u8 {
        self.spec.key.bus
    }

    fn address(&self) -> u8 {
        self.spec.key.address
    }

    fn device_descriptor(&self) -> transport::Result<DeviceDescriptor> {
        Ok(self.spec.descriptor.clone())
    }

    fn active_config_descriptor(&self) -> transport::Result<ConfigDescriptor> {
        Ok(self.spec.config.clone())
    }

    fn speed(&self) -> LinkSpeed {
        self.spec.speed
    }

    fn max_packet_size(&self, _endpoint: u8) -> transport::Result<u16> {
        self.spec.max_packet_size.ok_or(TransportError::NotFound)
    }

    fn open(&self) -> transport::Result<Arc<dyn TransportHandle>> {
        if let Some(err) = &self.spec.open_error {
            return Err(err.clone());
        }
        self.shared.state().log.opened += 1;
        Ok(Arc::new(MockHandle {
            spec: Arc::clone(&self.spec),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockHandle {
    spec: Arc<MockDeviceSpec>,
    shared: Arc<MockShared>,
}

impl MockHandle {
    fn attached(&self, state: &MockState) -> bool {
        state.attached.iter().any(|d| d.key == self.spec.key)
    }

    /// Answer a GET_DESCRIPTOR(STRING) request from the device script
    fn answer_control(&self, transfer: &mut Transfer) -> TransferStatus {
        let Some(setup) = transfer.control_setup() else {
            return TransferStatus::Stall;
        };
        let index = (setup.value & 0xff) as u8;

        let (status, payload) = if index == 0 {
            let mut payload = vec![4u8, 0x03];
            payload.extend_from_slice(&self.spec.lang_id.to_le_bytes());
            (self.spec.langid_status, payload)
        } else if index == self.spec.descriptor.serial_number_index {
            (
                self.spec.serial_status,
                create_mock_string_descriptor(&self.spec.serial),
            )
        } else {
            return TransferStatus::Stall;
        };

        if status == TransferStatus::Completed {
            let len = payload.len().min(transfer.data_capacity());
            transfer.buffer_mut()[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + len]
                .copy_from_slice(&payload[..len]);
            transfer.set_actual_length(len);
        }
        status
    }
}

impl TransportHandle for MockHandle {
    fn active_configuration(&self) -> transport::Result<u8> {
        let state = self.shared.state();
        state
            .configurations
            .get(&self.spec.key)
            .copied()
            .ok_or(TransportError::NoDevice)
    }

    fn set_active_configuration(&self, config: u8) -> transport::Result<()> {
        let mut state = self.shared.state();
        state.log.set_configurations.push((self.spec.key, config));
        state.configurations.insert(self.spec.key, config);
        Ok(())
    }

    fn kernel_driver_active(&self, interface: u8) -> transport::Result<bool> {
        Ok(self.spec.kernel_driver_interfaces.contains(&interface))
    }

    fn detach_kernel_driver(&self, interface: u8) -> transport::Result<()> {
        self.shared
            .state()
            .log
            .detached_drivers
            .push((self.spec.key, interface));
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> transport::Result<()> {
        if let Some(err) = &self.spec.claim_error {
            return Err(err.clone());
        }
        self.shared
            .state()
            .log
            .claimed_interfaces
            .push((self.spec.key, interface));
        Ok(())
    }

    fn submit(&self, mut transfer: Transfer, on_complete: CompletionFn) -> Result<(), SubmitError> {
        if let TransferKind::Bulk { endpoint } = transfer.kind() {
            let hook = if endpoint & 0x80 == 0 {
                self.shared.state().before_bulk_out.take()
            } else {
                None
            };
            if let Some(hook) = hook {
                hook();
            }
        }

        let mut state = self.shared.state();
        if !self.attached(&state) {
            return Err(SubmitError {
                error: TransportError::NoDevice,
                transfer,
            });
        }

        let kind = transfer.kind();
        match kind {
            TransferKind::Control => {
                let status = self.answer_control(&mut transfer);
                state.ready.push_back(Ready {
                    transfer,
                    on_complete,
                    status,
                });
            }
            TransferKind::Bulk { endpoint } if endpoint & 0x80 != 0 => {
                let failures = state.bulk_in_failures.entry(self.spec.key).or_insert(0);
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SubmitError {
                        error: TransportError::Busy,
                        transfer,
                    });
                }
                state.log.submits.push((self.spec.key, transfer.id(), kind));
                state.pending_in.push(Pending {
                    key: self.spec.key,
                    transfer,
                    on_complete,
                });
                return Ok(());
            }
            TransferKind::Bulk { .. } if self.spec.hold_bulk_out => {
                state.log.submits.push((self.spec.key, transfer.id(), kind));
                state.pending_out.push(Pending {
                    key: self.spec.key,
                    transfer,
                    on_complete,
                });
                return Ok(());
            }
            TransferKind::Bulk { .. } => {
                let len = transfer.buffer().len();
                transfer.set_actual_length(len);
                state.ready.push_back(Ready {
                    transfer,
                    on_complete,
                    status: TransferStatus::Completed,
                });
            }
        }

        let id = state.ready.back().map(|r| r.transfer.id());
        if let Some(id) = id {
            state.log.submits.push((self.spec.key, id, kind));
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> transport::Result<()> {
        let mut state = self.shared.state();
        state.log.cancels.push(id);

        let state = &mut *state;
        for queue in [&mut state.pending_in, &mut state.pending_out] {
            let Some(pos) = queue.iter().position(|p| p.transfer.id() == id) else {
                continue;
            };
            let pending = queue.remove(pos);
            state.ready.push_back(Ready {
                transfer: pending.transfer,
                on_complete: pending.on_complete,
                status: TransferStatus::Cancelled,
            });
            return Ok(());
        }

        if state.ready.iter().any(|r| r.transfer.id() == id) {
            // already completing
            return Ok(());
        }
        Err(TransportError::NotFound)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.shared.state().log.closed += 1;
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::ControlSetup;

    struct Recorder(Arc<Mutex<Vec<(bool, DeviceKey)>>>);

    impl HotplugHandler for Recorder {
        fn device_arrived(&mut self, device: Box<dyn TransportDevice>) {
            let key = DeviceKey::new(device.bus_number(), device.address());
            self.0.lock().unwrap().push((true, key));
        }

        fn device_left(&mut self, device: Box<dyn TransportDevice>) {
            let key = DeviceKey::new(device.bus_number(), device.address());
            self.0.lock().unwrap().push((false, key));
        }
    }

    fn filter() -> HotplugFilter {
        HotplugFilter {
            vendor_id: Some(MOCK_APPLE_VENDOR_ID),
            product_id: None,
            enumerate: true,
        }
    }

    #[test]
    fn test_create_mock_string_descriptor() {
        let desc = create_mock_string_descriptor(&[0x41, 0x42]);
        assert_eq!(desc, vec![6, 0x03, 0x41, 0x00, 0x42, 0x00]);
    }

    #[test]
    fn test_hotplug_enumerate_and_deregister() {
        let transport = MockTransport::new();
        transport.attach(MockDeviceBuilder::apple(1, 4).build());
        transport.attach(MockDeviceBuilder::apple(1, 5).vendor_id(0x1234).build());

        let events = Arc::new(Mutex::new(Vec::new()));
        transport
            .register_hotplug(filter(), Box::new(Recorder(Arc::clone(&events))))
            .unwrap();
        assert_eq!(*events.lock().unwrap(), vec![(true, DeviceKey::new(1, 4))]);

        transport.attach(MockDeviceBuilder::apple(2, 9).build());
        transport.handle_events().unwrap();
        assert_eq!(events.lock().unwrap().len(), 2);

        transport.deregister_hotplug();
        let left = events.lock().unwrap().iter().filter(|(a, _)| !a).count();
        assert_eq!(left, 3);
        assert!(!transport.is_registered());
    }

    #[test]
    fn test_control_transfer_answers_langid() {
        let transport = MockTransport::new();
        let spec = MockDeviceBuilder::apple(1, 4).build();
        transport.attach(spec.clone());

        let device = transport.device(spec);
        let handle = device.open().unwrap();
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        let transfer = Transfer::control(ControlSetup::get_string_descriptor(0, 0, 1024), None);
        handle
            .submit(
                transfer,
                Box::new(move |transfer, status| {
                    *slot.lock().unwrap() = Some((status, transfer.data().to_vec()));
                }),
            )
            .unwrap();
        transport.handle_events().unwrap();

        let (status, data) = result.lock().unwrap().take().unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(data, vec![4, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn test_bulk_in_cancel_completes_once() {
        let transport = MockTransport::new();
        let spec = MockDeviceBuilder::apple(1, 4).build();
        transport.attach(spec.clone());
        let handle = transport.device(spec).open().unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let transfer = Transfer::bulk(0x81, 64, None);
        let id = transfer.id();
        handle
            .submit(transfer, Box::new(move |_, status| sink.lock().unwrap().push(status)))
            .unwrap();

        assert_eq!(transport.pending_bulk_in(), vec![id]);
        handle.cancel(id).unwrap();
        handle.cancel(id).unwrap();
        transport.handle_events().unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![TransferStatus::Cancelled]);
        assert!(handle.cancel(id).is_err());
    }

    #[test]
    fn test_held_bulk_out_waits_for_cancel() {
        let transport = MockTransport::new();
        let spec = MockDeviceBuilder::apple(1, 4).hold_bulk_out().build();
        transport.attach(spec.clone());
        let handle = transport.device(spec).open().unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let transfer = Transfer::bulk_out(0x02, vec![1, 2, 3], None);
        let id = transfer.id();
        handle
            .submit(transfer, Box::new(move |_, status| sink.lock().unwrap().push(status)))
            .unwrap();

        transport.handle_events().unwrap();
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(transport.pending_bulk_out_for(DeviceKey::new(1, 4)), vec![id]);

        handle.cancel(id).unwrap();
        transport.handle_events().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![TransferStatus::Cancelled]);
        assert!(transport.pending_bulk_out_for(DeviceKey::new(1, 4)).is_empty());
        assert_eq!(transport.log().freed, vec![id]);
    }

    #[test]
    fn test_resubmitted_transfer_is_not_freed() {
        let transport = MockTransport::new();
        let spec = MockDeviceBuilder::apple(1, 4).build();
        transport.attach(spec.clone());
        let handle = transport.device(spec).open().unwrap();

        let transfer = Transfer::bulk(0x81, 64, None);
        let id = transfer.id();
        let resubmit = Arc::clone(&handle);
        handle
            .submit(
                transfer,
                Box::new(move |transfer, _| {
                    resubmit
                        .submit(transfer, Box::new(|_, _| {}))
                        .unwrap();
                }),
            )
            .unwrap();

        assert!(transport.complete_bulk_in(id, TransferStatus::Completed, &[0xaa]));
        transport.handle_events().unwrap();
        assert!(transport.log().freed.is_empty());
        assert_eq!(transport.pending_bulk_in(), vec![id]);

        assert!(transport.complete_bulk_in(id, TransferStatus::Error, &[]));
        transport.handle_events().unwrap();
        assert_eq!(transport.log().freed, vec![id]);
    }

    #[test]
    fn test_handle_close_is_logged() {
        let transport = MockTransport::new();
        let spec = MockDeviceBuilder::apple(1, 4).build();
        transport.attach(spec.clone());

        let handle = transport.device(spec).open().unwrap();
        drop(handle);

        let log = transport.log();
        assert_eq!(log.opened, 1);
        assert_eq!(log.closed, 1);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
