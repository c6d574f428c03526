//! Bus access seen by one attached device
//!
//! The transfer channel talks to hardware only through [`UsbBackend`]. The
//! production implementation wraps a `rusb` device handle; tests use the
//! in-process double from [`crate::test_utils`]. Completion codes are
//! `rusb::Error` in both cases, so error mapping is shared.
//!
//! Closing the device is tied to `Drop`: the device context drops its
//! backend exactly once, when the attachment is torn down. Detach calls
//! [`UsbBackend::cancel_transfers`] from another thread while a transfer may
//! still be blocked on the bus.

use protocol::{ControlSetup, EndpointAddress};
use std::time::Duration;

pub trait UsbBackend: Send + Sync {
    /// Blocking bulk IN transfer into `buf`, returning the bytes received
    fn read_bulk(
        &self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Blocking bulk OUT transfer of `buf`, returning the bytes sent
    fn write_bulk(
        &self,
        endpoint: EndpointAddress,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Control transfer with an IN data stage of up to `buf.len()` bytes
    fn read_control(
        &self,
        setup: &ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Control transfer with an OUT data stage (possibly empty)
    fn write_control(
        &self,
        setup: &ControlSetup,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Issue CLEAR_FEATURE(ENDPOINT_HALT) on `endpoint`
    fn clear_halt(&self, endpoint: EndpointAddress) -> rusb::Result<()>;

    /// Abort the blocking transfer in flight, if any, and refuse new ones
    ///
    /// The aborted call returns an error promptly instead of running out its
    /// timeout.
    fn cancel_transfers(&self);
}
