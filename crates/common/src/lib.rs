//! Common utilities for the CAEN USB driver
//!
//! This crate provides functionality shared by the driver engine and its
//! command-line front end: the error taxonomy every caller-facing operation
//! reports, logging setup, and the USB data types describing an attached
//! device.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceIdentity, DeviceInfo, DeviceState, EndpointDescriptors, EndpointInfo};
