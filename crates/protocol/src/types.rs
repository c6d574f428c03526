//! USB wire-level type definitions
//!
//! This module defines the device-facing vocabulary used by the driver:
//! device identifiers, transfer directions, endpoint addresses and the
//! setup packet of a control transfer.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard request code CLEAR_FEATURE (bRequest)
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;

/// Feature selector ENDPOINT_HALT (wValue of CLEAR_FEATURE)
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Direction bit of bmRequestType and of endpoint addresses
const DIRECTION_IN_BIT: u8 = 0x80;

/// Unique device identifier (driver-assigned)
///
/// Assigned when a physical device is attached. The ID is stable for the
/// lifetime of the attachment and is the key callers open sessions with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caenusb{}", self.0)
    }
}

/// Transfer direction, named from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device-to-host
    In,
    /// Host-to-device
    Out,
}

impl Direction {
    fn from_bit(byte: u8) -> Self {
        if byte & DIRECTION_IN_BIT != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    fn bit(self) -> u8 {
        match self {
            Direction::In => DIRECTION_IN_BIT,
            Direction::Out => 0,
        }
    }
}

/// Endpoint address (bEndpointAddress), including the direction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// The default control endpoint
    pub const CONTROL: EndpointAddress = EndpointAddress(0);

    pub fn new(number: u8, direction: Direction) -> Self {
        Self((number & 0x0f) | direction.bit())
    }

    pub fn direction(self) -> Direction {
        Direction::from_bit(self.0)
    }

    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }

    pub fn is_control(self) -> bool {
        self.number() == 0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Request kind, bits 5..6 of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// Request recipient, bits 0..4 of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Decoded bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestType {
    pub direction: Direction,
    pub kind: RequestKind,
    pub recipient: Recipient,
}

impl RequestType {
    pub fn new(direction: Direction, kind: RequestKind, recipient: Recipient) -> Self {
        Self {
            direction,
            kind,
            recipient,
        }
    }

    /// Encode as the raw bmRequestType byte
    pub fn to_bits(self) -> u8 {
        let kind = match self.kind {
            RequestKind::Standard => 0,
            RequestKind::Class => 1,
            RequestKind::Vendor => 2,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
        };
        self.direction.bit() | (kind << 5) | recipient
    }

    /// Decode a raw bmRequestType byte
    ///
    /// The reserved request kind (3) and recipients above 3 are rejected.
    pub fn from_bits(bits: u8) -> Result<Self> {
        let kind = match (bits >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => return Err(ProtocolError::InvalidRequestType(bits)),
        };
        let recipient = match bits & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => return Err(ProtocolError::InvalidRequestType(bits)),
        };

        Ok(Self {
            direction: Direction::from_bit(bits),
            kind,
            recipient,
        })
    }
}

/// Setup stage of a control transfer, minus wLength
///
/// wLength is derived from the data stage at transfer time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Vendor-specific request addressed to the device
    pub fn vendor(direction: Direction, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: RequestType::new(direction, RequestKind::Vendor, Recipient::Device),
            request,
            value,
            index,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for `endpoint`
    pub fn clear_halt(endpoint: EndpointAddress) -> Self {
        Self {
            request_type: RequestType::new(
                Direction::Out,
                RequestKind::Standard,
                Recipient::Endpoint,
            ),
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint.0 as u16,
        }
    }

    pub fn direction(&self) -> Direction {
        self.request_type.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(EndpointAddress(0x82).direction(), Direction::In);
        assert_eq!(EndpointAddress(0x02).direction(), Direction::Out);
        assert_eq!(EndpointAddress(0x82).number(), 2);
        assert!(EndpointAddress::CONTROL.is_control());
        assert_eq!(EndpointAddress::new(6, Direction::In), EndpointAddress(0x86));
    }

    #[test]
    fn test_request_type_bits() {
        let rt = RequestType::new(Direction::In, RequestKind::Vendor, Recipient::Device);
        assert_eq!(rt.to_bits(), 0xc0);
        assert_eq!(RequestType::from_bits(0xc0).unwrap(), rt);

        let out = RequestType::from_bits(0x41).unwrap();
        assert_eq!(out.direction, Direction::Out);
        assert_eq!(out.kind, RequestKind::Vendor);
        assert_eq!(out.recipient, Recipient::Interface);
    }

    #[test]
    fn test_reserved_request_kind_rejected() {
        assert!(RequestType::from_bits(0x60).is_err());
        assert!(RequestType::from_bits(0x04).is_err());
    }

    #[test]
    fn test_clear_halt_setup() {
        let setup = ControlSetup::clear_halt(EndpointAddress(0x86));
        assert_eq!(setup.request_type.to_bits(), 0x02);
        assert_eq!(setup.request, REQUEST_CLEAR_FEATURE);
        assert_eq!(setup.value, FEATURE_ENDPOINT_HALT);
        assert_eq!(setup.index, 0x86);
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(3).to_string(), "caenusb3");
    }
}
