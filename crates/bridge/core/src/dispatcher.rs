//! Wiring between services, pending requests and the reader monitor

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::error::BridgeError;
use crate::monitor::{ReaderChangeHandler, ReaderMonitor, WakeReason};
use crate::reader_state::{ChangeKind, ReaderStateSnapshot};
use crate::registry::RequestRegistry;
use crate::request::{PendingRequest, RequestId, ServiceHandle};
use crate::resource::ResourceManager;
use crate::service::Service;
use crate::settings::Settings;
use crate::sink::MessageSink;

/// Open services by handle
type ServiceTable<R> = RwLock<BTreeMap<ServiceHandle, Arc<Service<R>>>>;

/// Owns the open services, the pending requests and the monitor thread
/// feeding them.
pub struct Dispatcher<R: ResourceManager> {
    // Drop order: the monitor thread is joined before the state it reports to
    monitor: ReaderMonitor<R>,
    core: Arc<DispatchCore<R>>,
}

struct DispatchCore<R: ResourceManager> {
    requests: RequestRegistry,
    services: ServiceTable<R>,
    resources: Arc<R>,
    sink: Arc<dyn MessageSink>,
}

impl<R: ResourceManager> fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("monitor", &self.monitor)
            .field("services", &self.core.services.read().keys().collect::<Vec<_>>())
            .field("requests", &self.core.requests)
            .finish()
    }
}

impl<R: ResourceManager> Dispatcher<R> {
    /// Start the monitor over `resources`, posting messages to `sink`
    pub fn new(resources: Arc<R>, sink: Arc<dyn MessageSink>) -> Result<Self, BridgeError> {
        let core = Arc::new(DispatchCore {
            requests: RequestRegistry::new(Arc::clone(&sink)),
            services: RwLock::new(BTreeMap::new()),
            resources: Arc::clone(&resources),
            sink,
        });
        let monitor = ReaderMonitor::spawn(resources, Arc::clone(&core))?;
        info!("Dispatcher started");
        Ok(Self { monitor, core })
    }

    /// Open a service under `handle`
    pub fn create_service(
        &self,
        handle: ServiceHandle,
        settings: Settings,
    ) -> Result<Arc<Service<R>>, BridgeError> {
        let service = {
            let mut services = self.core.services.write();
            if services.contains_key(&handle) {
                return Err(BridgeError::ServiceExists(handle));
            }
            let service = Arc::new(Service::new(
                handle,
                settings,
                Arc::clone(&self.core.resources),
                Arc::clone(&self.core.sink),
            ));
            services.insert(handle, Arc::clone(&service));
            service
        };

        // Have every reader report its state so the new service learns
        // about cards that are already present
        self.monitor.wake(WakeReason::Resync);
        Ok(service)
    }

    /// Close a service, cancelling its pending requests
    pub fn remove_service(&self, handle: ServiceHandle) -> Result<Arc<Service<R>>, BridgeError> {
        let service = self
            .core
            .services
            .write()
            .remove(&handle)
            .ok_or(BridgeError::InvalidService(handle))?;

        let cancelled = self.core.requests.cancel_service(handle);
        if cancelled > 0 {
            self.monitor.wake(WakeReason::Deadline);
        }
        service.disconnect();
        info!(service = handle, cancelled, "Service closed");
        Ok(service)
    }

    /// Look up an open service
    pub fn service(&self, handle: ServiceHandle) -> Option<Arc<Service<R>>> {
        self.core.services.read().get(&handle).cloned()
    }

    /// Handles of all open services
    pub fn service_handles(&self) -> Vec<ServiceHandle> {
        self.core.services.read().keys().copied().collect()
    }

    /// Queue a request, waking the monitor if it now expires first
    pub fn add_request(&self, request: PendingRequest) -> Result<(), BridgeError> {
        let key = request.key();
        let nearest = self.core.requests.add(request)?;
        debug!(request = %key, nearest, "Request queued");
        if nearest {
            self.monitor.wake(WakeReason::Deadline);
        }
        Ok(())
    }

    /// Cancel one pending request. Returns whether it was pending.
    pub fn cancel_request(&self, service: ServiceHandle, request: RequestId) -> bool {
        let found = self.core.requests.cancel(service, request);
        if found {
            self.monitor.wake(WakeReason::Deadline);
        }
        found
    }

    /// Cancel every pending request of `service`
    pub fn cancel_service_requests(&self, service: ServiceHandle) -> usize {
        let cancelled = self.core.requests.cancel_service(service);
        if cancelled > 0 {
            self.monitor.wake(WakeReason::Deadline);
        }
        cancelled
    }

    /// Cancel every pending request
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.core.requests.cancel_all();
        if cancelled > 0 {
            self.monitor.wake(WakeReason::Deadline);
        }
        cancelled
    }

    /// Deliver a reader change to services, then to pending requests
    pub fn dispatch_change(&self, state: &ReaderStateSnapshot, kind: ChangeKind) {
        self.core.on_change(state, kind);
    }

    /// Pending requests
    pub fn requests(&self) -> &RequestRegistry {
        &self.core.requests
    }
}

impl<R: ResourceManager> ReaderChangeHandler for DispatchCore<R> {
    fn next_timeout(&self) -> Option<Duration> {
        self.requests.next_timeout()
    }

    fn on_timeout(&self, now: Instant) {
        let expired = self.requests.expire_due(now);
        if expired > 0 {
            debug!(expired, "Requests timed out");
        }
    }

    fn on_change(&self, state: &ReaderStateSnapshot, kind: ChangeKind) {
        // Services bind before requests look at the binding
        let services: Vec<_> = self.services.read().values().cloned().collect();
        for service in &services {
            service.notify(state, kind);
        }

        let completed = self.requests.notify_change(state, kind);
        trace!(reader = state.name(), ?kind, completed, "Change dispatched");
    }
}
