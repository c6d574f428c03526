//! USB transfer engine
//!
//! Manages device contexts, sessions and blocking transfers for attached
//! CAEN bridges.
//!
//! This module implements:
//! - Attach/detach handling and the device registry (`manager`)
//! - Per-device state, buffer and transfer serialization (`context`)
//! - Caller sessions issuing read, write and control requests (`session`)
//! - Copies between caller memory and the transfer buffer (`bridge`)
//! - Blocking bulk/control transfers with halt recovery (`transfers`)
//! - The libusb-backed device and hot-plug worker (`rusb_backend`, `hotplug`)

pub mod backend;
pub mod bridge;
pub mod context;
pub mod hotplug;
pub mod manager;
pub mod rusb_backend;
pub mod session;
pub mod stats;
pub mod transfers;

// Re-export public types
pub use backend::UsbBackend;
pub use bridge::{UserMemory, UserSlice, UserSliceMut, stage_in, stage_out};
pub use context::{ContextLimits, DeviceContext};
pub use hotplug::{HotplugWorker, attach_present_devices, spawn_hotplug_worker};
pub use manager::{LifecycleManager, ManagerSettings};
pub use rusb_backend::{OpenOptions, RusbBackend};
pub use session::{ControlData, ControlOutcome, ControlRequest, SessionHandle, SessionTimeouts};
pub use stats::TransferStatsSnapshot;
pub use transfers::{StallPolicy, TransferChannel, TransferKind, TransferRequest};
