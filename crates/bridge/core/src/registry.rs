//! Registry of pending requests
//!
//! Requests are indexed twice: by deadline, to find what has expired and
//! when the monitor has to wake up next, and by `(service, request id)`, to
//! cancel them. Both indexes live behind one re-entrant lock so they never
//! diverge, and completions are posted while that lock is held so a request
//! cannot be resolved twice.
//!
//! The `RefCell` borrow is always released before completions are posted.
//! A sink that calls back into the registry from the posting thread
//! therefore re-enters the lock instead of deadlocking or panicking.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use tracing::{debug, error, trace};

use crate::error::RegistryError;
use crate::reader_state::{ChangeKind, ReaderStateSnapshot};
use crate::request::{PendingRequest, RequestId, RequestKey, ServiceHandle, Trigger};
use crate::sink::MessageSink;
use crate::xfs::Message;

/// Position in the deadline index. The sequence number orders requests
/// sharing a deadline by insertion.
type Slot = (Instant, u64);

#[derive(Debug)]
struct Entry {
    slot: Slot,
    request: PendingRequest,
}

#[derive(Debug, Default)]
struct Requests {
    by_deadline: BTreeMap<Slot, RequestKey>,
    by_key: HashMap<RequestKey, Entry>,
    next_seq: u64,
}

impl Requests {
    fn insert(&mut self, request: PendingRequest) -> Slot {
        let slot = (request.deadline(), self.next_seq);
        self.next_seq += 1;
        self.by_deadline.insert(slot, request.key());
        self.by_key.insert(request.key(), Entry { slot, request });
        slot
    }

    fn remove(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        let entry = self.by_key.remove(key)?;
        self.by_deadline.remove(&entry.slot);
        Some(entry.request)
    }

    fn head(&self) -> Option<&Slot> {
        self.by_deadline.keys().next()
    }

    /// Keys in deadline order
    fn keys(&self) -> impl Iterator<Item = &RequestKey> {
        self.by_deadline.values()
    }

    /// Detach every request with a deadline at or before `now`
    fn split_due(&mut self, now: Instant) -> Vec<PendingRequest> {
        let pending = self.by_deadline.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.by_deadline, pending);
        due.into_values()
            .filter_map(|key| self.by_key.remove(&key))
            .map(|entry| entry.request)
            .collect()
    }
}

/// Thread-safe collection of pending requests
pub struct RequestRegistry {
    requests: ReentrantMutex<RefCell<Requests>>,
    sink: Arc<dyn MessageSink>,
}

impl fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl RequestRegistry {
    /// Create an empty registry posting completions to `sink`
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            requests: ReentrantMutex::new(RefCell::new(Requests::default())),
            sink,
        }
    }

    /// Insert a request.
    ///
    /// Returns whether it now has the earliest deadline of all pending
    /// requests, in which case a blocked monitor has to be woken up. A second
    /// request with the same key is rejected and nothing is posted for it.
    pub fn add(&self, request: PendingRequest) -> Result<bool, RegistryError> {
        let guard = self.requests.lock();
        let mut requests = guard.borrow_mut();

        let key = request.key();
        if requests.by_key.contains_key(&key) {
            error!(%key, "Request is already pending");
            return Err(RegistryError::Duplicate {
                service: key.service,
                request: key.request,
            });
        }

        let slot = requests.insert(request);
        let nearest = requests.head() == Some(&slot);
        debug!(%key, nearest, pending = requests.by_key.len(), "Request added");
        Ok(nearest)
    }

    /// Cancel one request. Returns whether it was pending.
    pub fn cancel(&self, service: ServiceHandle, request: RequestId) -> bool {
        let guard = self.requests.lock();
        let removed = guard.borrow_mut().remove(&RequestKey::new(service, request));

        match removed {
            Some(request) => {
                debug!(key = %request.key(), "Request cancelled");
                self.complete(&request, Trigger::Cancel);
                true
            }
            None => false,
        }
    }

    /// Cancel every request of `service`. Returns how many were pending.
    pub fn cancel_service(&self, service: ServiceHandle) -> usize {
        let guard = self.requests.lock();
        let removed: Vec<_> = {
            let mut requests = guard.borrow_mut();
            let keys: Vec<_> = requests
                .keys()
                .filter(|key| key.service == service)
                .copied()
                .collect();
            keys.iter().filter_map(|key| requests.remove(key)).collect()
        };

        for request in &removed {
            self.complete(request, Trigger::Cancel);
        }
        if !removed.is_empty() {
            debug!(service, count = removed.len(), "Service requests cancelled");
        }
        removed.len()
    }

    /// Cancel every pending request. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let guard = self.requests.lock();
        let removed: Vec<_> = {
            let mut requests = guard.borrow_mut();
            let keys: Vec<_> = requests.keys().copied().collect();
            keys.iter().filter_map(|key| requests.remove(key)).collect()
        };

        for request in &removed {
            self.complete(request, Trigger::Cancel);
        }
        removed.len()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        let guard = self.requests.lock();
        let requests = guard.borrow();
        requests.head().map(|(deadline, _)| *deadline)
    }

    /// Time left until the earliest deadline, `None` to wait indefinitely
    pub fn next_timeout(&self) -> Option<Duration> {
        self.next_timeout_at(Instant::now())
    }

    /// Time left from `now` until the earliest deadline
    pub fn next_timeout_at(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Complete every request with a deadline at or before `now` as timed
    /// out. Returns how many expired.
    pub fn expire_due(&self, now: Instant) -> usize {
        let guard = self.requests.lock();
        let expired = guard.borrow_mut().split_due(now);

        for request in &expired {
            debug!(key = %request.key(), "Request timed out");
            self.complete(request, Trigger::Deadline);
        }
        expired.len()
    }

    /// Resolve every request interested in a reader state change. Returns how
    /// many were resolved.
    pub fn notify_change(&self, state: &ReaderStateSnapshot, kind: ChangeKind) -> usize {
        let guard = self.requests.lock();
        let resolved: Vec<_> = {
            let mut requests = guard.borrow_mut();
            let matched: Vec<_> = requests
                .keys()
                .filter_map(|key| {
                    let entry = requests.by_key.get(key)?;
                    let messages = entry
                        .request
                        .resolve(Trigger::Change(state, kind))?;
                    Some((*key, messages))
                })
                .collect();

            matched
                .into_iter()
                .filter_map(|(key, messages)| {
                    requests.remove(&key).map(|request| (request, messages))
                })
                .collect()
        };

        for (request, messages) in &resolved {
            debug!(key = %request.key(), reader = state.name(), "Request resolved");
            self.post(request, messages.iter().cloned());
        }
        resolved.len()
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        let guard = self.requests.lock();
        guard.borrow().by_key.len()
    }

    /// Whether no request is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a request is pending
    pub fn contains(&self, service: ServiceHandle, request: RequestId) -> bool {
        let guard = self.requests.lock();
        guard
            .borrow()
            .by_key
            .contains_key(&RequestKey::new(service, request))
    }

    fn complete(&self, request: &PendingRequest, trigger: Trigger<'_>) {
        if let Some(messages) = request.resolve(trigger) {
            self.post(request, messages);
        }
    }

    fn post(&self, request: &PendingRequest, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            trace!(key = %request.key(), result = %message.result.result, "Posting completion");
            self.sink.post(request.window(), message);
        }
    }
}

impl Drop for RequestRegistry {
    fn drop(&mut self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Pending requests cancelled on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ReaderBinding;
    use crate::reader_state::ReaderFlags;
    use crate::request::WindowHandle;
    use crate::xfs::idc::DataSources;
    use crate::xfs::{MessageType, ResultCode};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    type Posted = Arc<Mutex<Vec<(WindowHandle, Message)>>>;

    fn registry() -> (RequestRegistry, Posted) {
        let posted: Posted = Arc::default();
        let sink = Arc::clone(&posted);
        let registry = RequestRegistry::new(Arc::new(move |window: WindowHandle, message: Message| {
            sink.lock().push((window, message));
        }));
        (registry, posted)
    }

    fn request(id: RequestId, now: Instant, after_ms: u64, reader: &str) -> PendingRequest {
        PendingRequest::card_insertion(
            RequestKey::new(1, id),
            WindowHandle(u64::from(id)),
            now,
            Some(Duration::from_millis(after_ms)),
            DataSources::CHIP,
            Arc::new(ReaderBinding::new(1, Some(reader.into()))),
        )
    }

    fn inserted(reader: &str) -> ReaderStateSnapshot {
        let mut state = ReaderStateSnapshot::new(reader, ReaderFlags::EMPTY);
        state.set_event(
            ReaderFlags::CHANGED | ReaderFlags::PRESENT,
            Bytes::from_static(&[0x3B]),
        );
        state
    }

    fn completions(posted: &Posted) -> Vec<(RequestId, ResultCode)> {
        posted
            .lock()
            .iter()
            .filter(|(_, message)| message.kind == MessageType::ExecuteComplete)
            .map(|(_, message)| (message.result.request_id, message.result.result))
            .collect()
    }

    fn assert_consistent(registry: &RequestRegistry) {
        let guard = registry.requests.lock();
        let requests = guard.borrow();
        let by_deadline: HashSet<_> = requests.by_deadline.values().copied().collect();
        let by_key: HashSet<_> = requests.by_key.keys().copied().collect();
        assert_eq!(by_deadline, by_key);
        assert_eq!(requests.by_deadline.len(), requests.by_key.len());
    }

    #[test]
    fn test_add_reports_nearest() {
        let (registry, _) = registry();
        let now = Instant::now();

        assert!(registry.add(request(1, now, 100, "r")).unwrap());
        assert!(registry.add(request(2, now, 50, "r")).unwrap());
        assert!(!registry.add(request(3, now, 200, "r")).unwrap());
        assert_eq!(registry.next_timeout_at(now), Some(Duration::from_millis(50)));
        assert_consistent(&registry);
    }

    #[test]
    fn test_equal_deadline_is_not_nearest() {
        let (registry, _) = registry();
        let now = Instant::now();

        assert!(registry.add(request(1, now, 50, "r")).unwrap());
        assert!(!registry.add(request(2, now, 50, "r")).unwrap());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 100, "r")).unwrap();
        let err = registry.add(request(1, now, 10, "r")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                service: 1,
                request: 1
            }
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.next_timeout_at(now), Some(Duration::from_millis(100)));
        assert!(posted.lock().is_empty());
    }

    #[test]
    fn test_match_resolves_only_matching_request() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 100, "first")).unwrap();
        registry.add(request(2, now, 50, "second")).unwrap();

        assert_eq!(registry.notify_change(&inserted("second"), ChangeKind::Card), 1);
        assert_eq!(completions(&posted), vec![(2, ResultCode::Success)]);
        assert!(registry.contains(1, 1));
        assert!(!registry.contains(1, 2));
        assert_eq!(registry.next_timeout_at(now), Some(Duration::from_millis(100)));
        assert_consistent(&registry);
    }

    #[test]
    fn test_non_matching_change_leaves_requests() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 100, "first")).unwrap();
        assert_eq!(registry.notify_change(&inserted("other"), ChangeKind::Card), 0);
        assert_eq!(registry.notify_change(&inserted("first"), ChangeKind::DeviceList), 0);
        assert!(posted.lock().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expire_due_removes_prefix() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 100, "r")).unwrap();
        registry.add(request(2, now, 50, "r")).unwrap();

        assert_eq!(registry.expire_due(now + Duration::from_millis(60)), 1);
        assert_eq!(completions(&posted), vec![(2, ResultCode::Timeout)]);
        assert!(registry.contains(1, 1));
        assert_consistent(&registry);
    }

    #[test]
    fn test_expire_due_includes_deadline_equal_to_now() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 50, "r")).unwrap();
        registry.add(request(2, now, 50, "r")).unwrap();
        registry.add(request(3, now, 51, "r")).unwrap();

        assert_eq!(registry.expire_due(now + Duration::from_millis(50)), 2);
        let mut expired = completions(&posted);
        expired.sort_by_key(|(id, _)| *id);
        assert_eq!(expired, vec![(1, ResultCode::Timeout), (2, ResultCode::Timeout)]);
        assert_eq!(registry.len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_cancel_nearest_updates_next_deadline() {
        let (registry, posted) = registry();
        let now = Instant::now();

        registry.add(request(1, now, 100, "r")).unwrap();
        registry.add(request(2, now, 50, "r")).unwrap();

        assert!(registry.cancel(1, 2));
        assert_eq!(registry.next_timeout_at(now), Some(Duration::from_millis(100)));
        assert!(registry.cancel(1, 1));
        assert_eq!(registry.next_timeout_at(now), None);
        assert!(!registry.cancel(1, 1));
        assert_eq!(
            completions(&posted),
            vec![(2, ResultCode::Canceled), (1, ResultCode::Canceled)]
        );
    }

    #[test]
    fn test_cancel_service_only_touches_its_requests() {
        let (registry, posted) = registry();
        let now = Instant::now();
        let other = PendingRequest::card_insertion(
            RequestKey::new(2, 1),
            WindowHandle(9),
            now,
            Some(Duration::from_millis(10)),
            DataSources::CHIP,
            Arc::new(ReaderBinding::new(2, None)),
        );

        registry.add(request(1, now, 100, "r")).unwrap();
        registry.add(request(2, now, 50, "r")).unwrap();
        registry.add(other).unwrap();

        assert_eq!(registry.cancel_service(1), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(2, 1));
        assert_eq!(completions(&posted).len(), 2);
    }

    #[test]
    fn test_drop_cancels_every_request_once() {
        let (registry, posted) = registry();
        let now = Instant::now();
        for id in 0..5 {
            registry.add(request(id, now, 100 + u64::from(id), "r")).unwrap();
        }

        drop(registry);
        let mut cancelled = completions(&posted);
        cancelled.sort_by_key(|(id, _)| *id);
        assert_eq!(
            cancelled,
            (0..5).map(|id| (id, ResultCode::Canceled)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_completion_can_reenter_registry() {
        let registry: Arc<Mutex<Option<Arc<RequestRegistry>>>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = Arc::clone(&registry);
        let lens = Arc::clone(&seen);
        let sink = move |_: WindowHandle, _: Message| {
            if let Some(registry) = handle.lock().as_ref() {
                lens.lock().push(registry.len());
            }
        };
        let shared = Arc::new(RequestRegistry::new(Arc::new(sink)));
        *registry.lock() = Some(Arc::clone(&shared));

        let now = Instant::now();
        shared.add(request(1, now, 100, "r")).unwrap();
        assert!(shared.cancel(1, 1));
        assert_eq!(*seen.lock(), vec![0]);

        registry.lock().take();
    }
}
