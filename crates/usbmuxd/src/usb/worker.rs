//! USB worker thread
//!
//! The device manager's event pump blocks inside the transport, so it runs
//! on a dedicated thread beside the Tokio runtime. Identified devices and
//! their data reach the runtime through the multiplexer.

use crate::error::ManagerError;
use crate::mux::Multiplexer;
use crate::usb::manager::{DeviceManager, ManagerConfig, ManagerShared};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;
use transport::Transport;

/// Handle to the running device manager thread
pub struct ManagerWorker {
    shared: Arc<ManagerShared>,
    thread: JoinHandle<()>,
}

impl ManagerWorker {
    /// Ask the pump to exit; returns immediately
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Whether the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker thread to exit
    pub fn join(self) -> std::thread::Result<()> {
        self.thread.join()
    }
}

/// Create the device manager and start pumping its events
///
/// Startup errors (no hotplug support, registration failure) are returned
/// here rather than from the thread.
pub fn spawn_device_manager(
    transport: Arc<dyn Transport>,
    mux: Arc<dyn Multiplexer>,
    config: ManagerConfig,
) -> Result<ManagerWorker, ManagerError> {
    let manager = DeviceManager::new(transport, mux, config)?;
    let shared = Arc::clone(manager.shared());

    let thread = std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            manager.run();
            info!("USB worker thread stopped");
        })?;

    Ok(ManagerWorker { shared, thread })
}
