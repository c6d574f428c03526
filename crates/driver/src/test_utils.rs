//! Test utilities for the driver
//!
//! Provides an in-process [`UsbBackend`] double and helpers for building
//! attached devices without hardware.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{MockBackend, attach_mock};
//!
//! let mock = MockBackend::new();
//! let (manager, id) = attach_mock(&mock, 512);
//! let session = manager.open(id).unwrap();
//!
//! assert_eq!(session.write(&[1, 2, 3]).unwrap(), 3);
//! assert_eq!(session.read(3).unwrap(), vec![1, 2, 3]);
//! ```

use crate::usb::backend::UsbBackend;
use crate::usb::manager::{LifecycleManager, ManagerSettings};
use crate::usb::session::SessionTimeouts;
use common::{DeviceIdentity, EndpointDescriptors, EndpointInfo};
use protocol::{ControlSetup, DeviceId, EndpointAddress};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk-in endpoint of the test device
pub const TEST_BULK_IN: EndpointAddress = EndpointAddress(0x86);

/// Bulk-out endpoint of the test device
pub const TEST_BULK_OUT: EndpointAddress = EndpointAddress(0x02);

/// Scripted failure for the next transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Endpoint halt (reported by libusb as `Pipe`)
    Stall,
    /// Any other completion code
    Error(rusb::Error),
}

#[derive(Default)]
struct MockInner {
    loopback: VecDeque<u8>,
    faults: VecDeque<MockFault>,
    clear_halt_failures: VecDeque<rusb::Error>,
    halt_requests: Vec<ControlSetup>,
    control_log: Vec<(ControlSetup, Vec<u8>)>,
    control_response: Vec<u8>,
    write_log: Vec<Vec<u8>>,
    unplugged: bool,
    cancelled: bool,
    transfer_delay: Duration,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<MockInner>,
    data_ready: Condvar,
    transfer_calls: AtomicUsize,
    clear_halt_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    drops: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Controller for a simulated device
///
/// Bulk OUT data is looped back to bulk IN. Bulk IN blocks until data
/// arrives, the device is unplugged, transfers are cancelled, or the transfer
/// times out. Clones share the same simulated device.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.state.inner.lock().unwrap()
    }

    /// A backend instance to hand to `on_attach`
    pub fn device(&self) -> Box<dyn UsbBackend> {
        Box::new(MockDevice {
            state: self.state.clone(),
        })
    }

    /// Queue a failure for the next transfer
    pub fn inject(&self, fault: MockFault) {
        self.lock().faults.push_back(fault);
    }

    /// Make the next clear-halt fail with `error`
    pub fn fail_next_clear_halt(&self, error: rusb::Error) {
        self.lock().clear_halt_failures.push_back(error);
    }

    /// Make data available on the bulk IN endpoint
    pub fn push_in_data(&self, data: &[u8]) {
        self.lock().loopback.extend(data.iter().copied());
        self.state.data_ready.notify_all();
    }

    /// Data returned by IN control requests
    pub fn set_control_response(&self, data: Vec<u8>) {
        self.lock().control_response = data;
    }

    /// Hold every transfer in flight for at least `delay`
    pub fn set_transfer_delay(&self, delay: Duration) {
        self.lock().transfer_delay = delay;
    }

    /// Simulate the cable being pulled: pending and future transfers fail
    pub fn unplug(&self) {
        self.lock().unplugged = true;
        self.state.data_ready.notify_all();
    }

    pub fn transfer_calls(&self) -> usize {
        self.state.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn clear_halt_calls(&self) -> usize {
        self.state.clear_halt_calls.load(Ordering::SeqCst)
    }

    /// Number of times the engine asked the device to abort its transfers
    pub fn cancel_calls(&self) -> usize {
        self.state.cancel_calls.load(Ordering::SeqCst)
    }

    /// Endpoints CLEAR_FEATURE(ENDPOINT_HALT) was sent to, in order
    pub fn cleared_endpoints(&self) -> Vec<EndpointAddress> {
        self.lock()
            .halt_requests
            .iter()
            .map(|setup| EndpointAddress(setup.index as u8))
            .collect()
    }

    pub fn control_log(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.lock().control_log.clone()
    }

    /// Payloads of completed bulk OUT transfers, in order
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.lock().write_log.clone()
    }

    /// Number of backend instances dropped (devices closed)
    pub fn drop_count(&self) -> usize {
        self.state.drops.load(Ordering::SeqCst)
    }

    /// Largest number of transfers ever in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

struct MockDevice {
    state: Arc<MockState>,
}

struct InFlight<'a> {
    state: &'a MockState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockDevice {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.state.inner.lock().unwrap()
    }

    fn begin(&self) -> rusb::Result<InFlight<'_>> {
        self.state.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let window = InFlight { state: &self.state };

        let mut inner = self.lock();
        match inner.faults.pop_front() {
            Some(MockFault::Stall) => return Err(rusb::Error::Pipe),
            Some(MockFault::Error(e)) => return Err(e),
            None => {}
        }

        let delay = inner.transfer_delay;
        if !delay.is_zero() {
            // Cancellation and unplug cut the delay short
            inner = self
                .state
                .data_ready
                .wait_timeout_while(inner, delay, |i| !i.cancelled && !i.unplugged)
                .unwrap()
                .0;
        }
        if inner.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if inner.cancelled {
            return Err(rusb::Error::Interrupted);
        }
        Ok(window)
    }
}

impl UsbBackend for MockDevice {
    fn read_bulk(
        &self,
        _endpoint: EndpointAddress,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        let _window = self.begin()?;

        let inner = self.lock();
        let (mut inner, _) = self
            .state
            .data_ready
            .wait_timeout_while(inner, timeout, |i| {
                i.loopback.is_empty() && !i.unplugged && !i.cancelled
            })
            .unwrap();

        if inner.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if inner.cancelled {
            return Err(rusb::Error::Interrupted);
        }
        if inner.loopback.is_empty() {
            return Err(rusb::Error::Timeout);
        }

        let len = buf.len().min(inner.loopback.len());
        for (slot, byte) in buf.iter_mut().zip(inner.loopback.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }

    fn write_bulk(
        &self,
        _endpoint: EndpointAddress,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let _window = self.begin()?;

        let mut inner = self.lock();
        inner.loopback.extend(buf.iter().copied());
        inner.write_log.push(buf.to_vec());
        self.state.data_ready.notify_all();
        Ok(buf.len())
    }

    fn read_control(
        &self,
        setup: &ControlSetup,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let _window = self.begin()?;

        let mut inner = self.lock();
        inner.control_log.push((*setup, Vec::new()));
        let len = buf.len().min(inner.control_response.len());
        buf[..len].copy_from_slice(&inner.control_response[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        setup: &ControlSetup,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let _window = self.begin()?;

        self.lock().control_log.push((*setup, buf.to_vec()));
        Ok(buf.len())
    }

    fn clear_halt(&self, endpoint: EndpointAddress) -> rusb::Result<()> {
        self.state.clear_halt_calls.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.lock();
        inner.halt_requests.push(ControlSetup::clear_halt(endpoint));
        if inner.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        match inner.clear_halt_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn cancel_transfers(&self) {
        self.state.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().cancelled = true;
        self.state.data_ready.notify_all();
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Identity of a CAEN 21E1:0001 on bus 1, address 4
pub fn caen_identity() -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: 0x21e1,
        product_id: 0x0001,
        bus_number: 1,
        address: 4,
    }
}

/// Endpoint set whose transfers are all capped at `max_transfer_size`
pub fn test_endpoints(max_transfer_size: usize) -> EndpointDescriptors {
    let endpoint = |address| EndpointInfo {
        address,
        max_packet_size: 512,
        max_transfer_size,
    };
    EndpointDescriptors {
        bulk_in: endpoint(TEST_BULK_IN),
        bulk_out: endpoint(TEST_BULK_OUT),
        control_max_transfer: max_transfer_size,
    }
}

/// Manager settings with short timeouts suitable for tests
pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        timeouts: SessionTimeouts {
            bulk: Duration::from_millis(500),
            control: Duration::from_millis(500),
            lock_wait: Duration::from_secs(2),
        },
        ..ManagerSettings::default()
    }
}

/// Create a manager with one simulated device attached
pub fn attach_mock(mock: &MockBackend, max_transfer_size: usize) -> (LifecycleManager, DeviceId) {
    let manager = LifecycleManager::new(test_settings());
    let id = manager
        .on_attach(caen_identity(), test_endpoints(max_transfer_size), mock.device())
        .expect("mock attach failed");
    (manager, id)
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
