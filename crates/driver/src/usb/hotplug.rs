//! Hot-plug worker thread
//!
//! Dedicated thread that owns the libusb context, runs the
//! `handle_events()` loop and turns arrival/departure notifications into
//! `on_attach`/`on_detach` calls on the lifecycle manager.
//!
//! libusb delivers hot-plug callbacks from inside `handle_events()`, where
//! opening a device is not allowed. The callback therefore only queues a
//! [`BusEvent`]; the worker loop drains the queue once `handle_events()`
//! returns.

use crate::usb::manager::LifecycleManager;
use crate::usb::rusb_backend::{OpenOptions, RusbBackend};
use common::{Error, Result};
use protocol::DeviceId;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between checks of the shutdown flag
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bus change queued by the hot-plug callback
pub enum BusEvent {
    Arrived(Device<Context>),
    Left { bus_number: u8, address: u8 },
}

struct HotplugCallback {
    events: async_channel::Sender<BusEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Err(e) = self.events.try_send(BusEvent::Arrived(device)) {
            warn!("Dropped arrival event: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let event = BusEvent::Left {
            bus_number: device.bus_number(),
            address: device.address(),
        };
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropped departure event: {}", e);
        }
    }
}

/// Open a matching device and publish a context for it
pub fn attach_device(
    manager: &LifecycleManager,
    device: &Device<Context>,
    options: &OpenOptions,
) -> Result<DeviceId> {
    let (backend, identity, endpoints) = RusbBackend::open(device, options)?;
    manager.on_attach(identity, endpoints, Box::new(backend))
}

/// Attach every supported device currently on the bus
///
/// Devices that fail to attach are logged and skipped.
pub fn attach_present_devices(
    context: &Context,
    manager: &LifecycleManager,
    options: &OpenOptions,
) -> Result<Vec<DeviceId>> {
    let devices = context
        .devices()
        .map_err(|e| Error::Usb(format!("failed to enumerate devices: {}", e)))?;

    let mut attached = Vec::new();
    for device in devices.iter() {
        if !is_wanted(manager, &device) {
            continue;
        }
        match attach_device(manager, &device, options) {
            Ok(id) => attached.push(id),
            Err(e) => warn!(
                "Failed to attach device on bus {} address {}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    debug!("Enumerated {} supported devices", attached.len());
    Ok(attached)
}

fn is_wanted(manager: &LifecycleManager, device: &Device<Context>) -> bool {
    match device.device_descriptor() {
        Ok(descriptor) => manager.accepts(descriptor.vendor_id(), descriptor.product_id()),
        Err(e) => {
            debug!(
                "Skipping device on bus {} address {}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            false
        }
    }
}

/// Handle to the running hot-plug thread
pub struct HotplugWorker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl HotplugWorker {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the event loop and wait for the thread to exit
    ///
    /// Attached devices stay attached; call `detach_all` on the manager to
    /// release them.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle
            .join()
            .map_err(|_| Error::Usb("hot-plug worker panicked".to_string()))?
    }
}

/// Spawn the hot-plug thread
///
/// The thread enumerates supported devices already present, registers for
/// hot-plug notifications and runs until [`HotplugWorker::shutdown`].
pub fn spawn_hotplug_worker(
    manager: LifecycleManager,
    options: OpenOptions,
) -> Result<HotplugWorker> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::Builder::new()
        .name("caen-hotplug".to_string())
        .spawn(move || run_event_loop(manager, options, flag))?;

    Ok(HotplugWorker { shutdown, handle })
}

fn run_event_loop(
    manager: LifecycleManager,
    options: OpenOptions,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let context = Context::new()
        .map_err(|e| Error::Usb(format!("failed to create USB context: {}", e)))?;

    let (events_tx, events_rx) = async_channel::unbounded();

    attach_present_devices(&context, &manager, &options)?;

    let _registration = if rusb::has_hotplug() {
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(HotplugCallback { events: events_tx }))
            .map_err(|e| Error::Usb(format!("failed to register hot-plug callback: {}", e)))?;
        debug!("Hot-plug callbacks registered");
        Some(registration)
    } else {
        warn!("libusb has no hot-plug support; only devices present at startup are attached");
        None
    };

    info!("Hot-plug worker started");

    while !shutdown.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }

        while let Ok(event) = events_rx.try_recv() {
            handle_bus_event(&manager, event, &options);
        }
    }

    info!("Hot-plug worker stopped");
    Ok(())
}

fn handle_bus_event(manager: &LifecycleManager, event: BusEvent, options: &OpenOptions) {
    match event {
        BusEvent::Arrived(device) => {
            if !is_wanted(manager, &device) {
                return;
            }
            if let Err(e) = attach_device(manager, &device, options) {
                warn!(
                    "Failed to attach device on bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
            }
        }
        BusEvent::Left {
            bus_number,
            address,
        } => {
            if manager.on_detach_address(bus_number, address).is_none() {
                debug!(
                    "Departure of unmanaged device (bus={}, addr={})",
                    bus_number, address
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::manager::ManagerSettings;

    #[test]
    fn test_hotplug_worker_lifecycle() {
        let manager = LifecycleManager::new(ManagerSettings::default());

        // May fail without USB access; only the shutdown path is checked
        match spawn_hotplug_worker(manager, OpenOptions::default()) {
            Ok(worker) => {
                if let Err(e) = worker.shutdown() {
                    eprintln!("Hot-plug worker failed (expected without USB access): {}", e);
                }
            }
            Err(e) => eprintln!("Could not spawn hot-plug worker: {}", e),
        }
    }

    #[test]
    fn test_departure_of_unknown_device_is_ignored() {
        let manager = LifecycleManager::new(ManagerSettings::default());
        handle_bus_event(
            &manager,
            BusEvent::Left {
                bus_number: 9,
                address: 9,
            },
            &OpenOptions::default(),
        );
        assert!(manager.device_ids().is_empty());
    }
}
