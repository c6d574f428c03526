//! Device match table
//!
//! The set of vendor/product id patterns the driver binds to. The table is
//! fixed at build time and consulted read-only; configuration can append
//! extra patterns in the same `VID:PID` syntax.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One vendor/product id pattern
///
/// `product_id: None` matches every product of the vendor. bcdDevice and the
/// class fields are always wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMatch {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
}

/// Hardware the driver binds to: the V1718 bridge and the CAEN 21E1 family
pub static CAEN_DEVICE_TABLE: &[DeviceMatch] = &[
    DeviceMatch::device(0x0547, 0x1002),
    DeviceMatch::device(0x21e1, 0x0000),
    DeviceMatch::device(0x21e1, 0x0001),
    DeviceMatch::device(0x21e1, 0x0005),
];

impl DeviceMatch {
    pub const fn device(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
        }
    }

    pub const fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.is_none_or(|pid| pid == product_id)
    }

    /// Kernel-style module alias for this pattern
    pub fn modalias(&self) -> String {
        let product = match self.product_id {
            Some(pid) => format!("p{:04X}", pid),
            None => "p*".to_string(),
        };
        format!(
            "usb:v{:04X}{}d*dc*dsc*dp*ic*isc*ip*in*",
            self.vendor_id, product
        )
    }

    /// Parse a filter of the form `VID:PID` or `VID:*`
    ///
    /// Ids are hex with an optional `0x` prefix. A vendor wildcard is
    /// rejected: the driver never binds to every vendor.
    pub fn parse(filter: &str) -> Result<Self> {
        let (vid, pid) = filter
            .trim()
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidFilter(filter.to_string()))?;

        if vid == "*" || pid.contains(':') {
            return Err(ProtocolError::InvalidFilter(filter.to_string()));
        }

        let vendor_id = parse_hex_id(vid, "VID")?;
        let product_id = if pid == "*" {
            None
        } else {
            Some(parse_hex_id(pid, "PID")?)
        };

        Ok(Self {
            vendor_id,
            product_id,
        })
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product_id {
            Some(pid) => write!(f, "{:04x}:{:04x}", self.vendor_id, pid),
            None => write!(f, "{:04x}:*", self.vendor_id),
        }
    }
}

fn parse_hex_id(id: &str, field: &'static str) -> Result<u16> {
    let digits = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);

    if digits.is_empty() || digits.len() > 4 {
        return Err(ProtocolError::InvalidHexId {
            field,
            value: id.to_string(),
        });
    }

    u16::from_str_radix(digits, 16).map_err(|_| ProtocolError::InvalidHexId {
        field,
        value: id.to_string(),
    })
}

/// Check a VID/PID pair against the built-in table and any extra patterns
pub fn is_supported(vendor_id: u16, product_id: u16, extra: &[DeviceMatch]) -> bool {
    CAEN_DEVICE_TABLE
        .iter()
        .chain(extra)
        .any(|m| m.matches(vendor_id, product_id))
}
