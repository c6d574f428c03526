//! USB device description types
//!
//! Shared between the engine, which builds them at attach time, and the
//! command-line front end, which prints them.

use crate::{Error, Result};
use protocol::{DeviceId, Direction, EndpointAddress};
use serde::{Deserialize, Serialize};

/// Immutable identity of one physical attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
}

/// One data endpoint as negotiated at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    /// wMaxPacketSize from the endpoint descriptor
    pub max_packet_size: u16,
    /// Largest single transfer the driver issues on this endpoint
    pub max_transfer_size: usize,
}

/// Endpoints the driver uses on one device
///
/// Endpoint 0 is implicit; only its transfer size is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptors {
    pub bulk_in: EndpointInfo,
    pub bulk_out: EndpointInfo,
    pub control_max_transfer: usize,
}

impl EndpointDescriptors {
    /// Build a descriptor set, checking endpoint directions
    pub fn new(
        bulk_in: EndpointInfo,
        bulk_out: EndpointInfo,
        control_max_transfer: usize,
    ) -> Result<Self> {
        if bulk_in.address.direction() != Direction::In || bulk_in.address.is_control() {
            return Err(Error::InvalidRequest(format!(
                "bulk-in endpoint {} is not an IN endpoint",
                bulk_in.address
            )));
        }
        if bulk_out.address.direction() != Direction::Out || bulk_out.address.is_control() {
            return Err(Error::InvalidRequest(format!(
                "bulk-out endpoint {} is not an OUT endpoint",
                bulk_out.address
            )));
        }

        Ok(Self {
            bulk_in,
            bulk_out,
            control_max_transfer,
        })
    }

    /// Size the shared transfer buffer must have
    pub fn largest_transfer(&self) -> usize {
        self.bulk_in
            .max_transfer_size
            .max(self.bulk_out.max_transfer_size)
            .max(self.control_max_transfer)
    }
}

/// Attachment state of a device context
///
/// The only transition is `Active -> Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Active,
    Removed,
}

/// Snapshot of an attached device, for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub identity: DeviceIdentity,
    pub state: DeviceState,
    pub open_sessions: usize,
    pub buffer_capacity: usize,
}
