//! USB transfer execution
//!
//! The transfer channel issues exactly one blocking bulk or control transfer
//! per request and maps `rusb` completion codes onto the driver's error
//! taxonomy. A stalled endpoint gets a single CLEAR_FEATURE(ENDPOINT_HALT)
//! before the stall is reported, so the next request on that endpoint is not
//! wedged.

use crate::usb::backend::UsbBackend;
use crate::usb::stats::TransferStats;
use common::{EndpointDescriptors, Error, Result};
use protocol::{ControlSetup, Direction, EndpointAddress};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What the channel does after a stall has been cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallPolicy {
    /// Report `Stalled` once the halt is cleared
    #[default]
    Surface,
    /// Reissue the transfer once; a second stall is reported
    RetryOnce,
}

/// Endpoint selector of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk { endpoint: EndpointAddress },
    Control { setup: ControlSetup },
}

/// One transfer, as issued by a session
///
/// The data lives in the device context's transfer buffer; `length` is the
/// number of bytes of that buffer the transfer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub length: usize,
    pub timeout: Duration,
}

impl TransferRequest {
    pub fn bulk(endpoint: EndpointAddress, length: usize, timeout: Duration) -> Self {
        Self {
            kind: TransferKind::Bulk { endpoint },
            length,
            timeout,
        }
    }

    pub fn control(setup: ControlSetup, length: usize, timeout: Duration) -> Self {
        Self {
            kind: TransferKind::Control { setup },
            length,
            timeout,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.kind {
            TransferKind::Bulk { endpoint } => endpoint.direction(),
            TransferKind::Control { setup } => setup.direction(),
        }
    }

    /// Endpoint a halt would be cleared on
    pub fn endpoint(&self) -> EndpointAddress {
        match self.kind {
            TransferKind::Bulk { endpoint } => endpoint,
            TransferKind::Control { .. } => EndpointAddress::CONTROL,
        }
    }
}

/// Blocking transfer engine for one device
pub struct TransferChannel {
    backend: Arc<dyn UsbBackend>,
    endpoints: EndpointDescriptors,
    stall_policy: StallPolicy,
    stats: Arc<TransferStats>,
}

impl TransferChannel {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        endpoints: EndpointDescriptors,
        stall_policy: StallPolicy,
        stats: Arc<TransferStats>,
    ) -> Self {
        Self {
            backend,
            endpoints,
            stall_policy,
            stats,
        }
    }

    /// Largest transfer the channel accepts for `request`
    fn capacity_for(&self, request: &TransferRequest) -> Result<usize> {
        match request.kind {
            TransferKind::Bulk { endpoint } if endpoint == self.endpoints.bulk_in.address => {
                Ok(self.endpoints.bulk_in.max_transfer_size)
            }
            TransferKind::Bulk { endpoint } if endpoint == self.endpoints.bulk_out.address => {
                Ok(self.endpoints.bulk_out.max_transfer_size)
            }
            TransferKind::Bulk { endpoint } => Err(Error::InvalidRequest(format!(
                "endpoint {} is not a bulk endpoint of this device",
                endpoint
            ))),
            TransferKind::Control { .. } => Ok(self.endpoints.control_max_transfer),
        }
    }

    /// Execute `request` against the first `request.length` bytes of `buffer`
    ///
    /// Returns the number of bytes actually transferred, which may be less
    /// than requested (short transfer).
    pub fn execute(&self, request: &TransferRequest, buffer: &mut [u8]) -> Result<usize> {
        if request.timeout.is_zero() {
            return Err(Error::InvalidRequest(
                "transfer timeout must be non-zero".to_string(),
            ));
        }

        let capacity = self.capacity_for(request)?.min(buffer.len());
        if request.length > capacity {
            return Err(Error::InvalidLength {
                requested: request.length,
                capacity,
            });
        }

        let data = &mut buffer[..request.length];
        let endpoint = request.endpoint();
        let mut cleared_halts = 0;

        loop {
            match self.issue(request, data) {
                Ok(len) => {
                    self.stats
                        .record_completed(request.direction(), request.length, len);
                    if len < request.length {
                        debug!(
                            "Short transfer on {}: {} of {} bytes",
                            endpoint, len, request.length
                        );
                    } else {
                        debug!("Transfer on {} succeeded: {} bytes", endpoint, len);
                    }
                    return Ok(len);
                }
                Err(rusb::Error::Pipe) => {
                    self.stats.record_stall();
                    warn!("Endpoint {} stalled, clearing halt", endpoint);
                    self.recover_halt(endpoint)?;
                    cleared_halts += 1;

                    if self.stall_policy == StallPolicy::RetryOnce && cleared_halts == 1 {
                        debug!("Retrying transfer on {} after halt clear", endpoint);
                        continue;
                    }
                    return Err(Error::Stalled { endpoint });
                }
                Err(rusb::Error::Timeout) => {
                    self.stats.record_timeout();
                    debug!(
                        "Transfer on {} timed out after {:?}",
                        endpoint, request.timeout
                    );
                    return Err(Error::Timeout);
                }
                Err(e) => {
                    self.stats.record_error();
                    warn!("Transfer on {} failed: {}", endpoint, e);
                    return Err(map_rusb_error(e));
                }
            }
        }
    }

    fn issue(&self, request: &TransferRequest, data: &mut [u8]) -> rusb::Result<usize> {
        match (request.kind, request.direction()) {
            (TransferKind::Bulk { endpoint }, Direction::In) => {
                self.backend.read_bulk(endpoint, data, request.timeout)
            }
            (TransferKind::Bulk { endpoint }, Direction::Out) => {
                self.backend.write_bulk(endpoint, data, request.timeout)
            }
            (TransferKind::Control { setup }, Direction::In) => {
                self.backend.read_control(&setup, data, request.timeout)
            }
            (TransferKind::Control { setup }, Direction::Out) => {
                self.backend.write_control(&setup, data, request.timeout)
            }
        }
    }

    /// Single clear-halt attempt; failure escalates past `Stalled`
    fn recover_halt(&self, endpoint: EndpointAddress) -> Result<()> {
        match self.backend.clear_halt(endpoint) {
            Ok(()) => {
                self.stats.record_halt_clear();
                debug!("Cleared halt on {}", endpoint);
                Ok(())
            }
            Err(rusb::Error::NoDevice) => Err(Error::Disconnected),
            Err(e) => {
                warn!("Clear-halt on {} failed: {}", endpoint, e);
                Err(Error::DeviceUnresponsive(format!(
                    "clear-halt on {} failed: {}",
                    endpoint, e
                )))
            }
        }
    }
}

/// Map rusb::Error to the driver error taxonomy
///
/// `Pipe` is handled by the channel before this mapping is reached.
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::Timeout,
        rusb::Error::NoDevice => Error::Disconnected,
        rusb::Error::Pipe => Error::Stalled {
            endpoint: EndpointAddress::CONTROL,
        },
        rusb::Error::InvalidParam => Error::InvalidRequest(err.to_string()),
        _ => Error::DeviceUnresponsive(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, MockFault, test_endpoints};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn channel(mock: &MockBackend, policy: StallPolicy) -> (TransferChannel, Arc<TransferStats>) {
        let stats = Arc::new(TransferStats::new());
        let channel = TransferChannel::new(
            mock.device().into(),
            test_endpoints(1024),
            policy,
            stats.clone(),
        );
        (channel, stats)
    }

    fn bulk_out(len: usize) -> TransferRequest {
        TransferRequest::bulk(test_endpoints(1024).bulk_out.address, len, TIMEOUT)
    }

    #[test]
    fn test_map_rusb_error() {
        assert!(matches!(map_rusb_error(rusb::Error::Timeout), Error::Timeout));
        assert!(matches!(map_rusb_error(rusb::Error::NoDevice), Error::Disconnected));
        assert!(matches!(
            map_rusb_error(rusb::Error::Io),
            Error::DeviceUnresponsive(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Overflow),
            Error::DeviceUnresponsive(_)
        ));
    }

    #[test]
    fn test_stall_clears_halt_once_and_surfaces() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Stall);
        let (channel, stats) = channel(&mock, StallPolicy::Surface);

        let mut buf = vec![0u8; 1024];
        let err = channel.execute(&bulk_out(16), &mut buf).unwrap_err();

        assert!(matches!(err, Error::Stalled { endpoint } if endpoint == EndpointAddress(0x02)));
        assert_eq!(mock.clear_halt_calls(), 1);
        assert_eq!(mock.cleared_endpoints(), vec![EndpointAddress(0x02)]);
        assert_eq!(stats.snapshot().halt_clears, 1);

        // Endpoint is usable again
        assert_eq!(channel.execute(&bulk_out(16), &mut buf).unwrap(), 16);
        assert_eq!(mock.clear_halt_calls(), 1);
    }

    #[test]
    fn test_stall_retry_once_succeeds() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Stall);
        let (channel, _stats) = channel(&mock, StallPolicy::RetryOnce);

        let mut buf = vec![7u8; 1024];
        assert_eq!(channel.execute(&bulk_out(8), &mut buf).unwrap(), 8);
        assert_eq!(mock.clear_halt_calls(), 1);
    }

    #[test]
    fn test_stall_retry_once_second_stall_surfaces() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Stall);
        mock.inject(MockFault::Stall);
        let (channel, _stats) = channel(&mock, StallPolicy::RetryOnce);

        let mut buf = vec![0u8; 1024];
        let err = channel.execute(&bulk_out(8), &mut buf).unwrap_err();
        assert!(matches!(err, Error::Stalled { .. }));
        // One clear-halt per stall event
        assert_eq!(mock.clear_halt_calls(), 2);
    }

    #[test]
    fn test_failed_clear_halt_escalates() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Stall);
        mock.fail_next_clear_halt(rusb::Error::Io);
        let (channel, _stats) = channel(&mock, StallPolicy::RetryOnce);

        let mut buf = vec![0u8; 1024];
        let err = channel.execute(&bulk_out(8), &mut buf).unwrap_err();
        assert!(matches!(err, Error::DeviceUnresponsive(_)));
        assert_eq!(mock.clear_halt_calls(), 1);
    }

    #[test]
    fn test_control_stall_clears_endpoint_zero() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Stall);
        let (channel, _stats) = channel(&mock, StallPolicy::Surface);

        let setup = ControlSetup::vendor(Direction::In, 0x01, 0, 0);
        let mut buf = vec![0u8; 1024];
        let err = channel
            .execute(&TransferRequest::control(setup, 4, TIMEOUT), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::Stalled { endpoint } if endpoint.is_control()));
        assert_eq!(mock.cleared_endpoints(), vec![EndpointAddress::CONTROL]);
    }

    #[test]
    fn test_length_over_capacity_rejected_without_io() {
        let mock = MockBackend::new();
        let (channel, _stats) = channel(&mock, StallPolicy::Surface);

        let mut buf = vec![0u8; 1024];
        let err = channel.execute(&bulk_out(1025), &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidLength {
                requested: 1025,
                capacity: 1024
            }
        ));
        assert_eq!(mock.transfer_calls(), 0);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mock = MockBackend::new();
        let (channel, _stats) = channel(&mock, StallPolicy::Surface);

        let request = TransferRequest::bulk(EndpointAddress(0x02), 4, Duration::ZERO);
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            channel.execute(&request, &mut buf),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_foreign_endpoint_rejected() {
        let mock = MockBackend::new();
        let (channel, _stats) = channel(&mock, StallPolicy::Surface);

        let request = TransferRequest::bulk(EndpointAddress(0x83), 4, TIMEOUT);
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            channel.execute(&request, &mut buf),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_short_read_reported_as_count() {
        let mock = MockBackend::new();
        mock.push_in_data(&[1, 2, 3]);
        let (channel, stats) = channel(&mock, StallPolicy::Surface);

        let request = TransferRequest::bulk(EndpointAddress(0x86), 64, TIMEOUT);
        let mut buf = vec![0u8; 1024];
        assert_eq!(channel.execute(&request, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(stats.snapshot().short_transfers, 1);
    }

    #[test]
    fn test_timeout_and_io_errors() {
        let mock = MockBackend::new();
        mock.inject(MockFault::Error(rusb::Error::Timeout));
        mock.inject(MockFault::Error(rusb::Error::Io));
        let (channel, stats) = channel(&mock, StallPolicy::Surface);

        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            channel.execute(&bulk_out(4), &mut buf),
            Err(Error::Timeout)
        ));
        assert!(matches!(
            channel.execute(&bulk_out(4), &mut buf),
            Err(Error::DeviceUnresponsive(_))
        ));
        // No silent retries
        assert_eq!(mock.transfer_calls(), 2);
        assert_eq!(mock.clear_halt_calls(), 0);

        let snap = stats.snapshot();
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.errors, 1);
    }
}
