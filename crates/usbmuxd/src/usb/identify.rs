//! Asynchronous device identification
//!
//! After probing, a device is identified by a chain of two control
//! transfers run entirely from completion callbacks:
//!
//! ```text
//! Probing -> AwaitingLangId -> AwaitingSerial -> StartingRxLoops -> HandedOff
//!     \______________\________________\_______________\___________> Failed
//! ```
//!
//! The chain owns the [`UsbDevice`] and the reusable control transfer by
//! value. Each completion is an event `(stage, status, transfer)` that
//! either moves them into the next submission or drops them. Dropping is
//! the rollback: the device handle closes, the transfer is freed, and the
//! [`ConstructingGuard`] removes the key from the constructing set.

use crate::error::IdentifyError;
use crate::usb::descriptors::SerialNumber;
use crate::usb::device::UsbDevice;
use crate::usb::manager::ManagerShared;
use crate::usb::{CONTROL_BUFFER_SIZE, CONTROL_TIMEOUT, receive};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use tracing::{debug, info, warn};
use transport::{
    CompletionFn, ControlSetup, DeviceKey, Transfer, TransferStatus, TransportError,
};

/// Identification stage of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probing,
    AwaitingLangId,
    AwaitingSerial,
    StartingRxLoops,
    HandedOff,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::HandedOff | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Probing => "probing",
            Stage::AwaitingLangId => "awaiting language ID",
            Stage::AwaitingSerial => "awaiting serial",
            Stage::StartingRxLoops => "starting RX loops",
            Stage::HandedOff => "handed off",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Membership of a key in the constructing set, released on drop
pub(crate) struct ConstructingGuard {
    shared: Arc<ManagerShared>,
    key: DeviceKey,
}

impl ConstructingGuard {
    /// Release `key` when the chain ends
    ///
    /// Does not insert: the prober adds the key once the first transfer is
    /// submitted. Completions are only dispatched by the thread running the
    /// prober, so the chain cannot end before that insert.
    pub(crate) fn new(shared: &Arc<ManagerShared>, key: DeviceKey) -> Self {
        Self {
            shared: Arc::clone(shared),
            key,
        }
    }
}

impl Drop for ConstructingGuard {
    fn drop(&mut self) {
        self.shared.constructing.erase(&self.key);
    }
}

/// One device moving through identification
pub(crate) struct Identification {
    device: UsbDevice,
    guard: ConstructingGuard,
    stage: Stage,
}

impl Identification {
    /// Request the language ID table (string descriptor 0)
    ///
    /// On error everything has already been released.
    pub(crate) fn start(device: UsbDevice, guard: ConstructingGuard) -> Result<(), TransportError> {
        let setup = ControlSetup::get_string_descriptor(0, 0, CONTROL_BUFFER_SIZE);
        let transfer = Transfer::control(setup, Some(CONTROL_TIMEOUT));

        let identification = Self {
            device,
            guard,
            stage: Stage::Probing,
        };
        identification.submit(Stage::AwaitingLangId, transfer)
    }

    fn key(&self) -> DeviceKey {
        self.device.key()
    }

    /// Move to `next` and hand the transfer (and ourselves) to the transport
    fn submit(mut self, next: Stage, transfer: Transfer) -> Result<(), TransportError> {
        debug!("Device {}: {} -> {}", self.key(), self.stage, next);
        self.stage = next;

        let handle = Arc::clone(self.device.handle());
        let on_complete: CompletionFn =
            Box::new(move |transfer, status| self.on_complete(transfer, status));
        handle.submit(transfer, on_complete).map_err(|e| e.error)
    }

    fn on_complete(self, transfer: Transfer, status: TransferStatus) {
        let key = self.key();
        let stage = self.stage;
        super::guarded("identification", key, move || {
            match self.advance(transfer, status) {
                Ok(next) if next.is_terminal() => info!("Device {} {}", key, next),
                Ok(_) => {}
                Err(e) => warn!("Device {}: {} -> {}: {}", key, stage, Stage::Failed, e),
            }
        });
    }

    /// Handle one completion event
    ///
    /// Returning an error after `self` has been consumed or dropped is the
    /// rollback path.
    fn advance(self, transfer: Transfer, status: TransferStatus) -> Result<Stage, IdentifyError> {
        if status != TransferStatus::Completed {
            return Err(IdentifyError::Transfer {
                stage: self.stage,
                status,
            });
        }

        match self.stage {
            Stage::AwaitingLangId => self.on_lang_id(transfer),
            Stage::AwaitingSerial => self.on_serial(transfer),
            other => Err(IdentifyError::UnexpectedCompletion(other)),
        }
    }

    fn on_lang_id(self, mut transfer: Transfer) -> Result<Stage, IdentifyError> {
        let data = transfer.data();
        if data.len() < 4 {
            return Err(IdentifyError::ShortLangId(data.len()));
        }
        let lang_id = LittleEndian::read_u16(&data[2..4]);
        info!("Got lang ID {:#06x} for device {}", lang_id, self.key());

        // same transfer, new request
        let index = self.device.descriptor().serial_number_index;
        transfer.set_control_setup(ControlSetup::get_string_descriptor(
            index,
            lang_id,
            CONTROL_BUFFER_SIZE,
        ));
        self.submit(Stage::AwaitingSerial, transfer)
            .map_err(IdentifyError::Submit)?;
        Ok(Stage::AwaitingSerial)
    }

    fn on_serial(self, transfer: Transfer) -> Result<Stage, IdentifyError> {
        let serial = SerialNumber::from_descriptor(transfer.data());
        drop(transfer);

        let Identification {
            mut device,
            guard,
            stage,
        } = self;
        let key = device.key();
        info!("Got serial '{}' for device {}", serial, key);
        device.set_serial(serial);

        let shared = Arc::clone(device.shared());
        if shared.is_stopping() {
            return Err(IdentifyError::ShuttingDown);
        }

        debug!("Device {}: {} -> {}", key, stage, Stage::StartingRxLoops);
        let device = Arc::new(device);
        let wanted = shared.config.rx_loops;
        let started = receive::start_rx_loops(&device, wanted, shared.config.rx_buffer_size);
        if started == 0 {
            return Err(IdentifyError::NoRxLoops);
        }
        if started < wanted {
            warn!(
                "Failed to start all {} RX loops for device {}. Going on with {} loops. This may have negative impact on device read speed.",
                wanted, key, started
            );
        } else {
            debug!("All {} RX loops started for device {}", wanted, key);
        }

        drop(guard);
        match shared.mux.add_device(Arc::clone(&device)) {
            Ok(()) => {
                device.mark_handed_off();
                Ok(Stage::HandedOff)
            }
            Err(e) => {
                device.kill();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_and_terminal() {
        assert_eq!(Stage::AwaitingLangId.to_string(), "awaiting language ID");
        assert_eq!(Stage::HandedOff.to_string(), "handed off");
        assert!(Stage::HandedOff.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::AwaitingSerial.is_terminal());
        assert!(!Stage::Probing.is_terminal());
    }
}
