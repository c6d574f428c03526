//! Device-facing protocol definitions for the CAEN USB driver
//!
//! This crate holds the wire vocabulary the driver speaks to the hardware:
//! transfer directions, endpoint addresses, control setup packets and the
//! table of vendor/product ids the driver binds to. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{CAEN_DEVICE_TABLE, is_supported};
//!
//! assert_eq!(CAEN_DEVICE_TABLE.len(), 4);
//! assert!(is_supported(0x21e1, 0x0001, &[]));
//! assert!(!is_supported(0x21e1, 0x0002, &[]));
//! ```

pub mod error;
pub mod match_table;
pub mod types;

pub use error::{ProtocolError, Result};
pub use match_table::{CAEN_DEVICE_TABLE, DeviceMatch, is_supported};
pub use types::{
    ControlSetup, DeviceId, Direction, EndpointAddress, FEATURE_ENDPOINT_HALT,
    REQUEST_CLEAR_FEATURE, Recipient, RequestKind, RequestType,
};
