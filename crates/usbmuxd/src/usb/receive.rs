//! Continuous receive loops
//!
//! Each loop is one bulk IN transfer that is resubmitted from its own
//! completion for as long as the device lives. Several loops per device keep
//! the bus busy; their completions are independent and unordered.
//!
//! Bookkeeping per loop: the transfer ID sits in the device's RX set and
//! holds one registration on its in-flight barrier from first submission
//! until the loop terminates, across every resubmission.

use crate::usb::device::UsbDevice;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use transport::{CompletionFn, SubmitError, Transfer, TransferId, TransferStatus, TransportError};

/// Start up to `count` receive loops; returns how many are running
pub(crate) fn start_rx_loops(device: &Arc<UsbDevice>, count: usize, buffer_size: usize) -> usize {
    let mut started = 0;
    for n in 1..=count {
        match start_rx_loop(device, buffer_size) {
            Ok(id) => {
                debug!("RX loop {} ({}) started for device {}", n, id, device.key());
                started += 1;
            }
            Err(e) => warn!(
                "Failed to start RX loop {} for device {}: {}",
                n,
                device.key(),
                e
            ),
        }
    }
    started
}

fn start_rx_loop(device: &Arc<UsbDevice>, buffer_size: usize) -> Result<TransferId, TransportError> {
    let transfer = Transfer::bulk(device.ep_in(), buffer_size, None);
    let id = transfer.id();

    device.in_flight.register();
    device.rx_transfers.insert(id);

    if let Err(e) = submit(device, transfer) {
        device.rx_transfers.erase(&id);
        device.in_flight.unregister();
        return Err(e.error);
    }
    Ok(id)
}

fn submit(device: &Arc<UsbDevice>, transfer: Transfer) -> Result<(), SubmitError> {
    let owner = Arc::clone(device);
    let on_complete: CompletionFn =
        Box::new(move |transfer, status| on_complete(owner, transfer, status));
    device.handle().submit(transfer, on_complete)
}

fn on_complete(device: Arc<UsbDevice>, transfer: Transfer, status: TransferStatus) {
    let key = device.key();
    let id = transfer.id();

    let mut terminated = true;
    super::guarded("RX completion", key, || {
        terminated = handle_completion(&device, transfer, status);
    });

    if terminated {
        device.rx_transfers.erase(&id);
        device.in_flight.unregister();
        device.kill();
    }
}

/// Deliver and resubmit, or report why the loop ends
///
/// Returns true when the loop has terminated; the transfer has been dropped
/// by then.
fn handle_completion(device: &Arc<UsbDevice>, transfer: Transfer, status: TransferStatus) -> bool {
    let key = device.key();
    let id = transfer.id();

    if status != TransferStatus::Completed {
        log_termination(device, status);
        return true;
    }

    device.on_data(transfer.data());

    if device.is_dying() {
        debug!("Device {} dying, RX transfer {} not resubmitted", key, id);
        return true;
    }

    match submit(device, transfer) {
        Ok(()) => {
            // teardown may have snapshotted the RX set while this transfer
            // was between completion and resubmission
            if device.is_dying() {
                let _ = device.handle().cancel(id);
            }
            false
        }
        Err(e) => {
            warn!("Failed to resubmit RX transfer for device {}: {}", key, e);
            true
        }
    }
}

fn log_termination(device: &UsbDevice, status: TransferStatus) {
    let key = device.key();
    match status {
        TransferStatus::Error => {
            info!("Device {} RX aborted due to error or disconnect", key)
        }
        TransferStatus::Cancelled => debug!("Device {} RX transfer cancelled", key),
        TransferStatus::NoDevice => info!("Device {} RX aborted due to disconnect", key),
        TransferStatus::TimedOut => error!("RX transfer timed out for device {}", key),
        TransferStatus::Stall => error!("RX transfer stalled for device {}", key),
        TransferStatus::Overflow => error!("RX transfer overflow for device {}", key),
        TransferStatus::Completed => {}
    }
}
