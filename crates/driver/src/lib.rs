//! CAEN USB driver engine
//!
//! A user-space driver core for CAEN data-acquisition bridges (V1718 and the
//! 21E1 family). One device context is created per attached device; callers
//! open sessions on it and issue blocking bulk and control transfers, which
//! are serialized per device and fenced against surprise removal.
//!
//! The `caen-usb` binary is a thin command-line front end over this crate.

pub mod config;
pub mod test_utils;
pub mod usb;

/// Revision reported to callers that query the driver version
pub const DRIVER_REVISION: &str = env!("CARGO_PKG_VERSION");

pub use config::DriverConfig;
pub use usb::{
    ControlData, ControlOutcome, ControlRequest, LifecycleManager, ManagerSettings,
    SessionHandle, SessionTimeouts, StallPolicy,
};
