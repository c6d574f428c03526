//! libusb-backed device access
//!
//! Opens a CAEN bridge through rusb, claims its data interface and discovers
//! the bulk endpoint pair. The claimed interface is released, and any kernel
//! driver that was detached is re-attached, when the backend is dropped.
//!
//! Cancelling releases the interface early: usbfs kills the URBs still
//! pending on it, so a transfer blocked in libusb returns with an error.

use crate::usb::backend::UsbBackend;
use common::{DeviceIdentity, EndpointDescriptors, EndpointInfo, Error, Result};
use protocol::{ControlSetup, Direction, EndpointAddress};
use rusb::{Context, Device, DeviceHandle, TransferType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// How a device is opened and how large its transfers may be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Interface carrying the bulk endpoint pair
    pub interface: u8,
    /// Upper bound on one bulk transfer
    pub max_transfer_size: usize,
    /// Upper bound on the data stage of one control transfer
    pub control_max_transfer: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            interface: 0,
            max_transfer_size: 64 * 1024,
            control_max_transfer: 4096,
        }
    }
}

/// rusb device handle with its claimed interface
pub struct RusbBackend {
    handle: DeviceHandle<Context>,
    interface: u8,
    claimed: AtomicBool,
    kernel_driver_detached: bool,
}

impl RusbBackend {
    /// Open `device`, claim the data interface and discover its endpoints
    pub fn open(
        device: &Device<Context>,
        options: &OpenOptions,
    ) -> Result<(Self, DeviceIdentity, EndpointDescriptors)> {
        let descriptor = device.device_descriptor().map_err(usb_error)?;
        let identity = DeviceIdentity {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
        };

        let endpoints = discover_endpoints(device, options)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            match e {
                rusb::Error::Access => Error::Usb(format!(
                    "permission denied opening bus {} address {}",
                    identity.bus_number, identity.address
                )),
                _ => usb_error(e),
            }
        })?;

        // Detach kernel driver if active
        let kernel_driver_detached = match handle.kernel_driver_active(options.interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {}",
                    options.interface
                );
                handle
                    .detach_kernel_driver(options.interface)
                    .map_err(usb_error)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    options.interface, e
                );
                false
            }
        };

        let backend = Self {
            handle,
            interface: options.interface,
            claimed: AtomicBool::new(false),
            kernel_driver_detached,
        };

        // On failure the backend drop re-attaches the kernel driver
        backend
            .handle
            .claim_interface(options.interface)
            .map_err(|e| {
                warn!("Failed to claim interface {}: {}", options.interface, e);
                usb_error(e)
            })?;
        backend.claimed.store(true, Ordering::SeqCst);
        debug!(
            "Claimed interface {} on bus {} address {}",
            options.interface, identity.bus_number, identity.address
        );

        Ok((backend, identity, endpoints))
    }

    fn ensure_claimed(&self) -> rusb::Result<()> {
        if self.claimed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(rusb::Error::Interrupted)
        }
    }

    /// Release the interface once, whoever gets there first
    fn release_interface(&self) {
        if !self.claimed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
    }
}

/// Find the first bulk IN/OUT pair of the data interface
fn discover_endpoints(
    device: &Device<Context>,
    options: &OpenOptions,
) -> Result<EndpointDescriptors> {
    let config = device.active_config_descriptor().map_err(usb_error)?;

    let mut bulk_in = None;
    let mut bulk_out = None;

    for interface in config.interfaces() {
        if interface.number() != options.interface {
            continue;
        }
        for alt in interface.descriptors() {
            for endpoint in alt.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                let info = EndpointInfo {
                    address: EndpointAddress(endpoint.address()),
                    max_packet_size: endpoint.max_packet_size(),
                    max_transfer_size: transfer_size(
                        options.max_transfer_size,
                        endpoint.max_packet_size(),
                    ),
                };
                let slot = match info.address.direction() {
                    Direction::In => &mut bulk_in,
                    Direction::Out => &mut bulk_out,
                };
                slot.get_or_insert(info);
            }
        }
    }

    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => {
            EndpointDescriptors::new(bulk_in, bulk_out, options.control_max_transfer)
        }
        _ => Err(Error::Usb(format!(
            "interface {} has no bulk endpoint pair",
            options.interface
        ))),
    }
}

/// Largest multiple of the packet size not above `limit` (at least one packet)
fn transfer_size(limit: usize, max_packet_size: u16) -> usize {
    let packet = usize::from(max_packet_size.max(1));
    (limit / packet).max(1) * packet
}

fn usb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice => Error::Disconnected,
        _ => Error::Usb(err.to_string()),
    }
}

impl UsbBackend for RusbBackend {
    fn read_bulk(
        &self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.ensure_claimed()?;
        self.handle.read_bulk(endpoint.0, buf, timeout)
    }

    fn write_bulk(
        &self,
        endpoint: EndpointAddress,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.ensure_claimed()?;
        self.handle.write_bulk(endpoint.0, buf, timeout)
    }

    fn read_control(
        &self,
        setup: &ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.ensure_claimed()?;
        self.handle.read_control(
            setup.request_type.to_bits(),
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }

    fn write_control(
        &self,
        setup: &ControlSetup,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.ensure_claimed()?;
        self.handle.write_control(
            setup.request_type.to_bits(),
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }

    fn clear_halt(&self, endpoint: EndpointAddress) -> rusb::Result<()> {
        self.ensure_claimed()?;
        self.handle.clear_halt(endpoint.0)
    }

    fn cancel_transfers(&self) {
        debug!("Aborting transfers on interface {}", self.interface);
        self.release_interface();
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        self.release_interface();

        // Reattach kernel driver to restore device to kernel control
        if self.kernel_driver_detached {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.interface);
            }
        }
    }
}
