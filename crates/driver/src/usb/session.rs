//! Session handles
//!
//! A [`SessionHandle`] is one caller's open session on a device context.
//! Any number of sessions may be open on a device, but only one transfer is
//! in flight per device at a time; every read, write and control request
//! takes the context's transfer semaphore for its whole duration.

use crate::DRIVER_REVISION;
use crate::usb::bridge::{UserMemory, stage_in, stage_out};
use crate::usb::context::DeviceContext;
use crate::usb::manager::Registry;
use crate::usb::stats::TransferStatsSnapshot;
use crate::usb::transfers::TransferRequest;
use common::{DeviceInfo, EndpointDescriptors, Error, Result};
use protocol::{ControlSetup, DeviceId, Direction};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default timeout for bulk transfers (5 seconds)
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for control transfers (1 second)
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on waiting for another session's transfer (10 seconds)
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Time limits applied to a session's requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub bulk: Duration,
    pub control: Duration,
    /// How long a request may wait for the device to become free
    pub lock_wait: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            bulk: DEFAULT_BULK_TIMEOUT,
            control: DEFAULT_CONTROL_TIMEOUT,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

/// Data stage of a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlData {
    /// Read up to this many bytes from the device
    In(usize),
    /// Send these bytes to the device (may be empty)
    Out(Vec<u8>),
}

/// A control request as issued by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub setup: ControlSetup,
    pub data: ControlData,
}

impl ControlRequest {
    pub fn new(setup: ControlSetup, data: ControlData) -> Self {
        Self { setup, data }
    }

    /// Vendor request with an IN data stage of `length` bytes
    pub fn vendor_in(request: u8, value: u16, index: u16, length: usize) -> Self {
        Self::new(
            ControlSetup::vendor(Direction::In, request, value, index),
            ControlData::In(length),
        )
    }

    /// Vendor request with an OUT data stage
    pub fn vendor_out(request: u8, value: u16, index: u16, data: Vec<u8>) -> Self {
        Self::new(
            ControlSetup::vendor(Direction::Out, request, value, index),
            ControlData::Out(data),
        )
    }
}

/// Result of a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Bytes returned by the device
    In(Vec<u8>),
    /// Bytes accepted by the device
    Out(usize),
}

/// One open session on a device context
///
/// Closing (explicitly or by drop) decrements the context's session count
/// and tears the context down if it was the last session on a removed
/// device.
pub struct SessionHandle {
    context: Arc<DeviceContext>,
    registry: Arc<Registry>,
    timeouts: SessionTimeouts,
    open: bool,
}

impl SessionHandle {
    pub(crate) fn open(registry: Arc<Registry>, id: DeviceId) -> Result<Self> {
        let context = registry.get(id).ok_or(Error::NotFound(id))?;
        let count = context.add_session()?;
        debug!("Opened session on {} ({} open)", id, count);

        Ok(Self {
            timeouts: registry.settings().timeouts,
            context,
            registry,
            open: true,
        })
    }

    /// Override the time limits for this session
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    pub fn device_id(&self) -> DeviceId {
        self.context.id()
    }

    pub fn info(&self) -> DeviceInfo {
        self.context.info()
    }

    pub fn endpoints(&self) -> EndpointDescriptors {
        self.context.endpoints()
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.context.stats()
    }

    /// Revision string of the driver serving this session
    pub fn driver_revision(&self) -> &'static str {
        DRIVER_REVISION
    }

    /// Bulk read of up to `length` bytes
    ///
    /// A short read returns fewer bytes; it is not an error. A length over
    /// the transfer buffer capacity is rejected before anything is allocated.
    pub fn read(&self, length: usize) -> Result<Vec<u8>> {
        let capacity = self.context.capacity();
        if length > capacity {
            return Err(Error::InvalidLength {
                requested: length,
                capacity,
            });
        }

        let mut data = vec![0u8; length];
        let count = self.read_into(&mut data, length)?;
        data.truncate(count);
        Ok(data)
    }

    /// Bulk read of up to `length` bytes into caller memory
    pub fn read_into<M>(&self, dst: &mut M, length: usize) -> Result<usize>
    where
        M: UserMemory + ?Sized,
    {
        let endpoint = self.context.endpoints().bulk_in.address;
        let request = TransferRequest::bulk(endpoint, length, self.timeouts.bulk);

        let guard = self.context.begin_io(self.timeouts.lock_wait)?;
        guard.run(|buffer, channel| {
            let count = channel.execute(&request, buffer)?;
            stage_out(buffer, count, dst)?;
            Ok(count)
        })
    }

    /// Bulk write of `data`, returning the bytes the device accepted
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_from(data, data.len())
    }

    /// Bulk write of the first `length` bytes of caller memory
    pub fn write_from<M>(&self, src: &M, length: usize) -> Result<usize>
    where
        M: UserMemory + ?Sized,
    {
        let endpoint = self.context.endpoints().bulk_out.address;
        let request = TransferRequest::bulk(endpoint, length, self.timeouts.bulk);

        let guard = self.context.begin_io(self.timeouts.lock_wait)?;
        guard.run(|buffer, channel| {
            stage_in(src, length, buffer)?;
            channel.execute(&request, buffer)
        })
    }

    /// Control transfer on endpoint 0
    pub fn control(&self, request: &ControlRequest) -> Result<ControlOutcome> {
        let direction = request.setup.direction();
        let length = match (&request.data, direction) {
            (ControlData::In(length), Direction::In) => *length,
            (ControlData::Out(data), Direction::Out) => data.len(),
            _ => {
                return Err(Error::InvalidRequest(
                    "control data stage does not match request direction".to_string(),
                ));
            }
        };
        let transfer = TransferRequest::control(request.setup, length, self.timeouts.control);

        let guard = self.context.begin_io(self.timeouts.lock_wait)?;
        guard.run(|buffer, channel| match &request.data {
            ControlData::In(_) => {
                let count = channel.execute(&transfer, buffer)?;
                let mut data = vec![0u8; count];
                stage_out(buffer, count, &mut data)?;
                Ok(ControlOutcome::In(data))
            }
            ControlData::Out(data) => {
                stage_in(data, length, buffer)?;
                channel.execute(&transfer, buffer).map(ControlOutcome::Out)
            }
        })
    }

    /// Close the session
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let remaining = self.context.drop_session();
        debug!(
            "Closed session on {} ({} open)",
            self.context.id(),
            remaining
        );
        if remaining == 0 && self.context.is_removed() {
            self.registry.destroy(&self.context);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, attach_mock};

    #[test]
    fn test_default_timeouts_are_bounded() {
        let timeouts = SessionTimeouts::default();
        assert!(!timeouts.bulk.is_zero());
        assert!(!timeouts.control.is_zero());
        assert!(!timeouts.lock_wait.is_zero());
    }

    #[test]
    fn test_control_direction_mismatch() {
        let mock = MockBackend::new();
        let (manager, id) = attach_mock(&mock, 512);
        let session = manager.open(id).unwrap();

        let request = ControlRequest::new(
            ControlSetup::vendor(Direction::In, 0x10, 0, 0),
            ControlData::Out(vec![1, 2]),
        );
        assert!(matches!(
            session.control(&request),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(mock.transfer_calls(), 0);
    }

    #[test]
    fn test_control_out_then_in() {
        let mock = MockBackend::new();
        mock.set_control_response(vec![0xde, 0xad]);
        let (manager, id) = attach_mock(&mock, 512);
        let session = manager.open(id).unwrap();

        let out = session
            .control(&ControlRequest::vendor_out(0x22, 1, 0, vec![9, 8, 7]))
            .unwrap();
        assert_eq!(out, ControlOutcome::Out(3));

        let input = session
            .control(&ControlRequest::vendor_in(0x23, 0, 0, 16))
            .unwrap();
        assert_eq!(input, ControlOutcome::In(vec![0xde, 0xad]));

        let log = mock.control_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0.request, 0x22);
        assert_eq!(log[0].1, vec![9, 8, 7]);
        assert_eq!(log[1].0.request, 0x23);
    }

    #[test]
    fn test_close_is_idempotent_with_drop() {
        let mock = MockBackend::new();
        let (manager, id) = attach_mock(&mock, 512);
        let session = manager.open(id).unwrap();
        assert_eq!(manager.get(id).unwrap().session_count(), 1);

        session.close();
        assert_eq!(manager.get(id).unwrap().session_count(), 0);
    }

    #[test]
    fn test_read_length_checked_before_allocation() {
        let mock = MockBackend::new();
        let (manager, id) = attach_mock(&mock, 512);
        let session = manager.open(id).unwrap();

        assert!(matches!(
            session.read(usize::MAX),
            Err(Error::InvalidLength {
                requested: usize::MAX,
                capacity: 512,
            })
        ));
        assert_eq!(mock.transfer_calls(), 0);
    }

    #[test]
    fn test_driver_revision() {
        let mock = MockBackend::new();
        let (manager, id) = attach_mock(&mock, 512);
        let session = manager.open(id).unwrap();
        assert_eq!(session.driver_revision(), env!("CARGO_PKG_VERSION"));
    }
}
