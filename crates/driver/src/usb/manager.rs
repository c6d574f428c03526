//! Device lifecycle manager
//!
//! Handles attach and detach events from the bus, keeps the registry of
//! device contexts callers open sessions against, and decides when a removed
//! context is finally torn down.
//!
//! A context is destroyed by whichever of {detach, last session close}
//! observes "no open sessions and removed". Until then a removed context
//! stays registered so that `open` reports `Gone`; afterwards `open` reports
//! `NotFound`.

use crate::usb::backend::UsbBackend;
use crate::usb::context::{ContextLimits, DeviceContext};
use crate::usb::session::{SessionHandle, SessionTimeouts};
use crate::usb::transfers::StallPolicy;
use common::{DeviceIdentity, DeviceInfo, EndpointDescriptors, Error, Result};
use protocol::{DeviceId, DeviceMatch, is_supported};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Settings shared by every context and session of a manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub limits: ContextLimits,
    pub timeouts: SessionTimeouts,
    /// Patterns accepted in addition to the built-in device table
    pub extra_matches: Vec<DeviceMatch>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            limits: ContextLimits {
                max_buffer_size: 1 << 20,
                stall_policy: StallPolicy::Surface,
            },
            timeouts: SessionTimeouts::default(),
            extra_matches: Vec::new(),
        }
    }
}

pub(crate) struct Registry {
    contexts: RwLock<HashMap<DeviceId, Arc<DeviceContext>>>,
    next_device_id: AtomicU32,
    settings: ManagerSettings,
}

impl Registry {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceId, Arc<DeviceContext>>> {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceId, Arc<DeviceContext>>> {
        self.contexts.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        self.read().get(&id).cloned()
    }

    pub(crate) fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Release a removed, idle context and drop it from the registry
    pub(crate) fn destroy(&self, context: &Arc<DeviceContext>) {
        if !context.release() {
            return;
        }

        let mut contexts = self.write();
        if contexts
            .get(&context.id())
            .is_some_and(|registered| Arc::ptr_eq(registered, context))
        {
            contexts.remove(&context.id());
            debug!("Deregistered {}", context.id());
        }
    }
}

/// Attach/detach handler and device registry
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<Registry>,
}

impl LifecycleManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            registry: Arc::new(Registry {
                contexts: RwLock::new(HashMap::new()),
                next_device_id: AtomicU32::new(1),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        self.registry.settings()
    }

    /// Check a VID/PID pair against the device table and configured filters
    pub fn accepts(&self, vendor_id: u16, product_id: u16) -> bool {
        is_supported(vendor_id, product_id, &self.settings().extra_matches)
    }

    /// Probe: build and publish a context for a newly attached device
    ///
    /// The context is fully initialised before it becomes visible; a failed
    /// attach publishes nothing.
    pub fn on_attach(
        &self,
        identity: DeviceIdentity,
        endpoints: EndpointDescriptors,
        backend: Box<dyn UsbBackend>,
    ) -> Result<DeviceId> {
        if !self.accepts(identity.vendor_id, identity.product_id) {
            return Err(Error::InvalidRequest(format!(
                "device {:04x}:{:04x} is not handled by this driver",
                identity.vendor_id, identity.product_id
            )));
        }

        // Duplicate check and publication happen under one write guard
        let mut contexts = self.registry.write();
        if let Some(existing) = active_at(&contexts, identity.bus_number, identity.address) {
            return Err(Error::InvalidRequest(format!(
                "bus {} address {} is already attached as {}",
                identity.bus_number, identity.address, existing
            )));
        }

        let id = DeviceId(self.registry.next_device_id.fetch_add(1, Ordering::SeqCst));
        let context = DeviceContext::new(
            id,
            identity,
            endpoints,
            backend,
            self.settings().limits,
        )
        .inspect_err(|e| {
            warn!(
                "Rejecting attach of {:04x}:{:04x}: {}",
                identity.vendor_id, identity.product_id, e
            )
        })?;

        info!(
            "Attached {}: {:04x}:{:04x} bus={} addr={} buffer={} bytes",
            id,
            identity.vendor_id,
            identity.product_id,
            identity.bus_number,
            identity.address,
            context.capacity()
        );

        contexts.insert(id, Arc::new(context));
        Ok(id)
    }

    /// Disconnect: mark the context removed and wake every blocked caller
    ///
    /// Does not wait for in-flight transfers. Resources are released here if
    /// no session is open, otherwise by the last session close.
    pub fn on_detach(&self, id: DeviceId) -> Result<()> {
        let context = self.registry.get(id).ok_or(Error::NotFound(id))?;

        if context.mark_removed() {
            info!(
                "Detached {} ({} open sessions)",
                id,
                context.session_count()
            );
        }

        if context.session_count() == 0 {
            self.registry.destroy(&context);
        }
        Ok(())
    }

    /// Disconnect by bus position, as reported by hot-plug events
    pub fn on_detach_address(&self, bus_number: u8, address: u8) -> Option<DeviceId> {
        let id = self.find_active_by_address(bus_number, address)?;
        self.on_detach(id).ok()?;
        Some(id)
    }

    /// Detach every registered device (driver unload)
    pub fn detach_all(&self) {
        for id in self.device_ids() {
            let _ = self.on_detach(id);
        }
    }

    /// Open a session on an attached device
    pub fn open(&self, id: DeviceId) -> Result<SessionHandle> {
        SessionHandle::open(self.registry.clone(), id)
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        self.registry.get(id)
    }

    fn find_active_by_address(&self, bus_number: u8, address: u8) -> Option<DeviceId> {
        active_at(&self.registry.read(), bus_number, address)
    }

    /// Registered device ids, in attach order
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.registry.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .registry
            .read()
            .values()
            .map(|ctx| ctx.info())
            .collect();
        devices.sort_by_key(|info| info.id);
        devices
    }
}

/// Active context attached at a bus position, if any
fn active_at(
    contexts: &HashMap<DeviceId, Arc<DeviceContext>>,
    bus_number: u8,
    address: u8,
) -> Option<DeviceId> {
    contexts
        .values()
        .find(|ctx| {
            let identity = ctx.identity();
            identity.bus_number == bus_number
                && identity.address == address
                && !ctx.is_removed()
        })
        .map(|ctx| ctx.id())
}
