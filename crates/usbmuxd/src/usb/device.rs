//! Identified USB device
//!
//! A [`UsbDevice`] is built during probing and owned by value by the
//! identification chain. Once its receive loops start it becomes an
//! `Arc<UsbDevice>` shared by the multiplexer and every in-flight transfer
//! callback. It is destroyed either by identification rollback (the chain
//! drops it) or by [`UsbDevice::kill`], never both.

use crate::error::DeviceError;
use crate::usb::descriptors::SerialNumber;
use crate::usb::manager::ManagerShared;
use common::{BroadcastEvent, GuardedSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};
use transport::{
    CompletionFn, DeviceDescriptor, DeviceKey, Transfer, TransferId, TransferStatus,
    TransportHandle,
};

/// Everything probing learns about a device before identification
pub(crate) struct DeviceParts {
    pub key: DeviceKey,
    pub descriptor: DeviceDescriptor,
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub max_packet_size: u16,
    pub speed: u64,
    pub handle: Arc<dyn TransportHandle>,
}

/// One identified Apple device and its bulk endpoint pair
pub struct UsbDevice {
    key: DeviceKey,
    descriptor: DeviceDescriptor,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    max_packet_size: u16,
    speed: u64,
    serial: SerialNumber,
    handle: Arc<dyn TransportHandle>,
    shared: Arc<ManagerShared>,
    pub(crate) rx_transfers: GuardedSet<TransferId>,
    pub(crate) tx_transfers: GuardedSet<TransferId>,
    /// One registration per submitted RX/TX transfer
    pub(crate) in_flight: BroadcastEvent,
    dying: AtomicBool,
    handed_off: AtomicBool,
}

impl UsbDevice {
    pub(crate) fn new(parts: DeviceParts, shared: Arc<ManagerShared>) -> Self {
        shared.live_devices.register();
        Self {
            key: parts.key,
            descriptor: parts.descriptor,
            interface: parts.interface,
            ep_in: parts.ep_in,
            ep_out: parts.ep_out,
            max_packet_size: parts.max_packet_size,
            speed: parts.speed,
            serial: SerialNumber::empty(),
            handle: parts.handle,
            shared,
            rx_transfers: GuardedSet::new(),
            tx_transfers: GuardedSet::new(),
            in_flight: BroadcastEvent::new(),
            dying: AtomicBool::new(false),
            handed_off: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn bus(&self) -> u8 {
        self.key.bus
    }

    pub fn address(&self) -> u8 {
        self.key.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn ep_in(&self) -> u8 {
        self.ep_in
    }

    pub fn ep_out(&self) -> u8 {
        self.ep_out
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Link speed in bits per second
    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: SerialNumber) {
        self.serial = serial;
    }

    pub(crate) fn handle(&self) -> &Arc<dyn TransportHandle> {
        &self.handle
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Relaxed)
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_handed_off(&self) {
        self.handed_off.store(true, Ordering::Relaxed);
    }

    /// RX transfers currently owned by the transport or a completion
    pub fn rx_in_flight(&self) -> usize {
        self.rx_transfers.len()
    }

    pub fn tx_in_flight(&self) -> usize {
        self.tx_transfers.len()
    }

    /// Deliver received bytes to the multiplexer
    pub fn on_data(&self, data: &[u8]) {
        trace!("Device {} received {} bytes", self.key, data.len());
        if let Err(e) = self.shared.mux.device_data_input(self, data) {
            warn!("Failed to deliver data from device {}: {}", self.key, e);
        }
    }

    /// Queue `data` on the OUT endpoint
    ///
    /// A payload that is a non-zero multiple of the max packet size is
    /// followed by a zero-length packet so the device sees the end of it.
    pub fn send(self: &Arc<Self>, data: &[u8]) -> Result<(), DeviceError> {
        if self.is_dying() {
            return Err(DeviceError::Dying);
        }

        self.submit_out(data.to_vec())?;
        if !data.is_empty() && data.len() % self.max_packet_size as usize == 0 {
            debug!("Sending ZLP to device {}", self.key);
            self.submit_out(Vec::new())?;
        }
        Ok(())
    }

    fn submit_out(self: &Arc<Self>, data: Vec<u8>) -> Result<(), DeviceError> {
        let transfer = Transfer::bulk_out(self.ep_out, data, None);
        let id = transfer.id();

        self.in_flight.register();
        self.tx_transfers.insert(id);

        let device = Arc::clone(self);
        let on_complete: CompletionFn =
            Box::new(move |transfer, status| device.tx_complete(transfer, status));
        if let Err(e) = self.handle.submit(transfer, on_complete) {
            self.tx_transfers.erase(&id);
            self.in_flight.unregister();
            return Err(DeviceError::Submit(e.error));
        }

        // teardown may have cancelled this ID before the transport knew it
        if self.is_dying() {
            if let Err(e) = self.handle.cancel(id) {
                debug!("Cancel of late TX {} on device {}: {}", id, self.key, e);
            }
        }
        Ok(())
    }

    fn tx_complete(self: Arc<Self>, transfer: Transfer, status: TransferStatus) {
        let id = transfer.id();
        super::guarded("TX completion", self.key, || match status {
            TransferStatus::Completed => trace!(
                "TX {} to device {} done ({} bytes)",
                id,
                self.key,
                transfer.actual_length()
            ),
            TransferStatus::Cancelled => debug!("TX {} to device {} cancelled", id, self.key),
            TransferStatus::NoDevice => info!("Device {} TX aborted due to disconnect", self.key),
            other => warn!("TX {} to device {} failed: {}", id, self.key, other),
        });

        self.tx_transfers.erase(&id);
        drop(transfer);
        self.in_flight.unregister();

        if status == TransferStatus::NoDevice {
            self.kill();
        }
    }

    /// Start tearing the device down
    ///
    /// Only the first call has an effect. In-flight transfers are cancelled
    /// and awaited on a separate thread: their completions are dispatched by
    /// the event pump, which may be the caller.
    pub fn kill(self: &Arc<Self>) {
        self.kill_with(|name, task| {
            std::thread::Builder::new()
                .name(name)
                .spawn(task)
                .map(drop)
        });
    }

    /// [`kill`](Self::kill) with the teardown thread started by `spawn`
    pub(crate) fn kill_with<S>(self: &Arc<Self>, spawn: S)
    where
        S: FnOnce(String, Box<dyn FnOnce() + Send>) -> std::io::Result<()>,
    {
        if self.dying.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Tearing down device {} ({})", self.key, self.serial);

        let device = Arc::clone(self);
        let name = format!("usb-teardown-{}", self.key);
        if let Err(e) = spawn(name, Box::new(move || device.teardown())) {
            error!(
                "Failed to spawn teardown thread for device {}, releasing without waiting: {}",
                self.key, e
            );
            // no waiting here: the caller may be the event pump
            self.cancel_in_flight();
            self.release();
        }
    }

    fn teardown(&self) {
        self.cancel_in_flight();
        self.in_flight.wait_idle();
        debug!("All transfers of device {} finished", self.key);
        self.release();
    }

    fn cancel_in_flight(&self) {
        let pending = self
            .rx_transfers
            .snapshot()
            .into_iter()
            .chain(self.tx_transfers.snapshot());
        for id in pending {
            // NotFound: already completing
            if let Err(e) = self.handle.cancel(id) {
                debug!("Cancel of {} on device {}: {}", id, self.key, e);
            }
        }
    }

    /// Tell the multiplexer the device is gone, if it was ever told about it
    fn release(&self) {
        if self.is_handed_off() {
            self.shared
                .mux
                .delete_device_async(self.key.bus, self.key.address);
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        debug!("Releasing device {}", self.key);
        self.shared.live_devices.unregister();
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("key", &self.key)
            .field("product_id", &format_args!("{:#06x}", self.descriptor.product_id))
            .field("serial", &self.serial)
            .field("interface", &self.interface)
            .field("ep_in", &format_args!("{:#04x}", self.ep_in))
            .field("ep_out", &format_args!("{:#04x}", self.ep_out))
            .field("max_packet_size", &self.max_packet_size)
            .field("speed", &self.speed)
            .field("dying", &self.is_dying())
            .finish()
    }
}
