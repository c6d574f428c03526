//! Common error types
//!
//! Every caller-facing operation returns either a byte count or one of these
//! kinds. `Gone` and `Disconnected` are ordinary outcomes: a caller holding a
//! stale session is expected to close it and carry on.

use protocol::{DeviceId, EndpointAddress};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No such device: {0}")]
    NotFound(DeviceId),

    #[error("Device removed")]
    Gone,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Endpoint {endpoint} stalled")]
    Stalled { endpoint: EndpointAddress },

    #[error("Device unresponsive: {0}")]
    DeviceUnresponsive(String),

    #[error("Unable to allocate a {requested} byte transfer buffer")]
    ResourceExhausted { requested: usize },

    #[error("Invalid length {requested} (capacity {capacity})")]
    InvalidLength { requested: usize, capacity: usize },

    #[error("Caller memory not accessible")]
    FaultyUserMemory,

    #[error("Device disconnected during transfer")]
    Disconnected,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error means the device is no longer attached
    pub fn is_removal(&self) -> bool {
        matches!(self, Error::Gone | Error::Disconnected)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_kinds() {
        assert!(Error::Gone.is_removal());
        assert!(Error::Disconnected.is_removal());
        assert!(!Error::Timeout.is_removal());
        assert!(!Error::NotFound(DeviceId(1)).is_removal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidLength {
            requested: 70000,
            capacity: 65536,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));

        let err = Error::Stalled {
            endpoint: EndpointAddress(0x86),
        };
        assert_eq!(err.to_string(), "Endpoint 0x86 stalled");

        assert_eq!(Error::NotFound(DeviceId(2)).to_string(), "No such device: caenusb2");
    }
}
