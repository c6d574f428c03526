//! Device context
//!
//! One [`DeviceContext`] exists per physical attachment. It owns the transfer
//! channel, the transfer buffer and the attachment state, and it fences
//! transfers against surprise removal.
//!
//! Two primitives guard a context:
//! - `state` (mutex) protects the small record of attachment state and the
//!   "transfer in flight" flag. It is only ever held briefly, so detach can
//!   always take it even while a transfer is blocked on the bus.
//! - `io_busy` together with the `wake` condition variable forms a binary
//!   semaphore that serializes transfer issuance. Waiters re-check their
//!   predicate after every wake and give up as soon as the device is removed.
//!
//! The transfer buffer and channel sit behind their own mutex, which only the
//! holder of the semaphore (or the final teardown) ever locks. A second
//! handle to the backend is kept outside that mutex so detach can abort a
//! transfer that is blocked on the bus.

use crate::usb::backend::UsbBackend;
use crate::usb::stats::{TransferStats, TransferStatsSnapshot};
use crate::usb::transfers::{StallPolicy, TransferChannel};
use common::{DeviceIdentity, DeviceInfo, DeviceState, EndpointDescriptors, Error, Result};
use protocol::DeviceId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Limits applied when a context is built
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    /// Largest transfer buffer an attach may allocate
    pub max_buffer_size: usize,
    pub stall_policy: StallPolicy,
}

struct ContextState {
    device: DeviceState,
    io_busy: bool,
}

struct IoResources {
    buffer: Vec<u8>,
    channel: TransferChannel,
}

pub struct DeviceContext {
    id: DeviceId,
    identity: DeviceIdentity,
    endpoints: EndpointDescriptors,
    capacity: usize,
    state: Mutex<ContextState>,
    wake: Condvar,
    io: Mutex<Option<IoResources>>,
    abort: Mutex<Option<Arc<dyn UsbBackend>>>,
    sessions: AtomicUsize,
    released: AtomicBool,
    stats: Arc<TransferStats>,
}

impl DeviceContext {
    /// Build a fully initialised context
    ///
    /// Fails with `ResourceExhausted` when the transfer buffer cannot be
    /// allocated; the backend is dropped (device closed) in that case.
    pub fn new(
        id: DeviceId,
        identity: DeviceIdentity,
        endpoints: EndpointDescriptors,
        backend: Box<dyn UsbBackend>,
        limits: ContextLimits,
    ) -> Result<Self> {
        let capacity = endpoints.largest_transfer();
        let buffer = allocate_buffer(capacity, limits.max_buffer_size)?;

        let backend: Arc<dyn UsbBackend> = Arc::from(backend);
        let stats = Arc::new(TransferStats::new());
        let channel = TransferChannel::new(
            backend.clone(),
            endpoints,
            limits.stall_policy,
            stats.clone(),
        );

        Ok(Self {
            id,
            identity,
            endpoints,
            capacity,
            state: Mutex::new(ContextState {
                device: DeviceState::Active,
                io_busy: false,
            }),
            wake: Condvar::new(),
            io: Mutex::new(Some(IoResources { buffer, channel })),
            abort: Mutex::new(Some(backend)),
            sessions: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            stats,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn endpoints(&self) -> EndpointDescriptors {
        self.endpoints
    }

    /// Transfer buffer size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> DeviceState {
        self.lock_state().device
    }

    pub fn is_removed(&self) -> bool {
        self.state() == DeviceState::Removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            identity: self.identity,
            state: self.state(),
            open_sessions: self.session_count(),
            buffer_capacity: self.capacity,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session; refused once the device is removed
    pub(crate) fn add_session(&self) -> Result<usize> {
        let state = self.lock_state();
        if state.device == DeviceState::Removed {
            return Err(Error::Gone);
        }
        Ok(self.sessions.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Drop a session, returning how many remain
    pub(crate) fn drop_session(&self) -> usize {
        let previous = self.sessions.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "session count underflow on {}", self.id);
        previous.saturating_sub(1)
    }

    /// Transition `Active -> Removed`, wake every waiter and abort the
    /// transfer in flight
    ///
    /// Returns false if the context was already removed. Never waits for an
    /// in-flight transfer.
    pub(crate) fn mark_removed(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.device == DeviceState::Removed {
                return false;
            }
            state.device = DeviceState::Removed;
            self.wake.notify_all();
        }

        let backend = self
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(backend) = backend {
            debug!("Cancelling transfers on {}", self.id);
            backend.cancel_transfers();
        }
        true
    }

    /// Tear down the buffer and close the device, at most once
    pub(crate) fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let resources = self
            .io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let backend = self
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(resources);
        drop(backend);

        info!(
            "Released {} ({:04x}:{:04x})",
            self.id, self.identity.vendor_id, self.identity.product_id
        );
        true
    }

    /// Take the transfer semaphore
    ///
    /// Blocks while another transfer is in flight, for at most `wait_limit`.
    /// Returns `Gone` as soon as the device is removed, whatever budget is
    /// left.
    pub(crate) fn begin_io(&self, wait_limit: Duration) -> Result<IoGuard<'_>> {
        let state = self.lock_state();
        let (mut state, _) = self
            .wake
            .wait_timeout_while(state, wait_limit, |s| {
                s.device == DeviceState::Active && s.io_busy
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.device == DeviceState::Removed {
            return Err(Error::Gone);
        }
        if state.io_busy {
            debug!("Timed out waiting for in-flight transfer on {}", self.id);
            return Err(Error::Timeout);
        }

        state.io_busy = true;
        Ok(IoGuard { context: self })
    }
}

/// Holder of a context's transfer semaphore
pub(crate) struct IoGuard<'a> {
    context: &'a DeviceContext,
}

impl IoGuard<'_> {
    /// Run `op` with exclusive access to the buffer and channel
    ///
    /// Removal is checked before and after `op`; an operation that returns
    /// after the device was removed reports `Disconnected`.
    pub(crate) fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut [u8], &TransferChannel) -> Result<T>,
    {
        if self.context.is_removed() {
            return Err(Error::Gone);
        }

        let mut io = self
            .context
            .io
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let resources = io.as_mut().ok_or(Error::Gone)?;
        let result = op(&mut resources.buffer, &resources.channel);
        drop(io);

        if self.context.is_removed() {
            debug!("{} removed during transfer", self.context.id);
            return Err(Error::Disconnected);
        }
        result
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.context.lock_state();
        state.io_busy = false;
        self.context.wake.notify_one();
    }
}

fn allocate_buffer(capacity: usize, max_buffer_size: usize) -> Result<Vec<u8>> {
    if capacity > max_buffer_size {
        return Err(Error::ResourceExhausted {
            requested: capacity,
        });
    }

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(capacity)
        .map_err(|_| Error::ResourceExhausted {
            requested: capacity,
        })?;
    buffer.resize(capacity, 0);
    Ok(buffer)
}
