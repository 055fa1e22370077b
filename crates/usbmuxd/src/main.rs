//! usbmuxd-rs daemon
//!
//! Watches the USB bus for Apple devices, identifies them and keeps their
//! bulk endpoints streaming until they are unplugged.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use transport::{LibusbTransport, Transport};
use usbmuxd::config::{self, DaemonConfig};
use usbmuxd::usb::speed_bps;
use usbmuxd::{DeviceRegistry, ManagerConfig, RegistryEvent, spawn_device_manager};

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "usbmuxd")]
#[command(author, version, about = "USB multiplexing daemon for Apple devices")]
#[command(long_about = "
Detects Apple devices on the USB bus, identifies them by serial number and
keeps their usbmux endpoints streaming until they are unplugged.

EXAMPLES:
    # Run with default config
    usbmuxd

    # Run with custom config
    usbmuxd --config ~/usbmuxd.toml

    # List attached Apple devices without starting the daemon
    usbmuxd --list-devices

    # Run with debug logging
    usbmuxd --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbmuxd-rs/usbmuxd.toml
    3. /etc/usbmuxd-rs/usbmuxd.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached Apple devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbmuxd-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let manager_config = config
        .manager_config()
        .context("Invalid USB configuration")?;
    let transport: Arc<dyn Transport> =
        Arc::new(LibusbTransport::new().context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices_mode(transport.as_ref(), &manager_config);
    }

    let (registry, events) = DeviceRegistry::new(EVENT_CHANNEL_CAPACITY);
    let registry = Arc::new(registry);

    let worker = spawn_device_manager(transport, registry.clone(), manager_config)
        .context("Failed to start device manager")?;

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_registry_event(&event);
        }
    });

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    worker.stop();
    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker thread: {}", e),
    }

    event_task.abort();
    info!("Shutdown complete, {} device(s) still registered", registry.len());
    Ok(())
}

/// List attached Apple devices in the usbmux range and exit
fn list_devices_mode(transport: &dyn Transport, config: &ManagerConfig) -> Result<()> {
    let devices = transport
        .devices()
        .context("Failed to enumerate USB devices")?;

    let mut found = 0;
    for device in devices {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if !config.accepts(descriptor.vendor_id, descriptor.product_id) {
            continue;
        }

        found += 1;
        println!(
            "  {:04x}:{:04x} Bus {:03} Device {:03} Speed: {} MBit/s",
            descriptor.vendor_id,
            descriptor.product_id,
            device.bus_number(),
            device.address(),
            speed_bps(device.speed()) / 1_000_000
        );
    }

    if found == 0 {
        println!("No Apple devices found.");
    } else {
        println!("\nFound {} Apple device(s)", found);
    }
    Ok(())
}

fn log_registry_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::DeviceAdded {
            key,
            product_id,
            serial,
            speed,
        } => info!(
            "Device {} connected: {} (pid {:#06x}, {} MBit/s)",
            key,
            serial,
            product_id,
            speed / 1_000_000
        ),
        RegistryEvent::DeviceRemoved { key, serial } => {
            info!("Device {} disconnected: {}", key, serial)
        }
        RegistryEvent::DataReceived { key, bytes } => {
            tracing::trace!("Device {}: {} bytes in", key, bytes)
        }
    }
}
