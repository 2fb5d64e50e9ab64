//! Pending asynchronous requests

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binding::ReaderBinding;
use crate::reader_state::{ChangeKind, ReaderStateSnapshot};
use crate::xfs::idc::{CommandCode, DataSources, EventId, card_data};
use crate::xfs::{Message, MessageType, Payload, ResultCode};

/// Handle of a logical service session
pub type ServiceHandle = u16;

/// Caller assigned request identifier, unique per service
pub type RequestId = u32;

/// Client window that receives messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub u64);

/// Identity of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    /// Owning service
    pub service: ServiceHandle,
    /// Request id within the service
    pub request: RequestId,
}

impl RequestKey {
    /// Create a key
    pub const fn new(service: ServiceHandle, request: RequestId) -> Self {
        Self { service, request }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.request)
    }
}

/// What a pending request waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Wait for a card to be inserted, then report the requested data
    CardInsertion {
        /// Data sources to report
        sources: DataSources,
    },
}

/// Event that may resolve a pending request
#[derive(Debug, Clone, Copy)]
pub(crate) enum Trigger<'a> {
    /// A reader state change was observed
    Change(&'a ReaderStateSnapshot, ChangeKind),
    /// The deadline passed
    Deadline,
    /// The request was cancelled or its owner is going away
    Cancel,
}

/// An outstanding asynchronous request.
///
/// The deadline is fixed at creation. Requests without a timeout get a
/// deadline far enough in the future to never expire in practice.
#[derive(Debug)]
pub struct PendingRequest {
    key: RequestKey,
    window: WindowHandle,
    deadline: Instant,
    kind: RequestKind,
    binding: Arc<ReaderBinding>,
}

/// Deadline used for requests that wait indefinitely
const INDEFINITE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

impl PendingRequest {
    /// Create a request with an absolute deadline
    pub const fn new(
        key: RequestKey,
        window: WindowHandle,
        deadline: Instant,
        kind: RequestKind,
        binding: Arc<ReaderBinding>,
    ) -> Self {
        Self {
            key,
            window,
            deadline,
            kind,
            binding,
        }
    }

    /// Wait for card insertion, expiring `timeout` after `now`
    pub fn card_insertion(
        key: RequestKey,
        window: WindowHandle,
        now: Instant,
        timeout: Option<Duration>,
        sources: DataSources,
        binding: Arc<ReaderBinding>,
    ) -> Self {
        // Timeouts past the end of the clock wait indefinitely
        let deadline = timeout
            .and_then(|timeout| now.checked_add(timeout))
            .or_else(|| now.checked_add(INDEFINITE))
            .unwrap_or(now);
        Self::new(
            key,
            window,
            deadline,
            RequestKind::CardInsertion { sources },
            binding,
        )
    }

    /// Request identity
    pub const fn key(&self) -> RequestKey {
        self.key
    }

    /// Window receiving the completion
    pub const fn window(&self) -> WindowHandle {
        self.window
    }

    /// Absolute deadline
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// What the request waits for
    pub const fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Whether a reader state change resolves this request
    pub fn matches(&self, state: &ReaderStateSnapshot, change: ChangeKind) -> bool {
        self.resolve(Trigger::Change(state, change)).is_some()
    }

    /// Decide whether `trigger` terminates the request and build the
    /// messages to post if it does.
    ///
    /// Deadlines and cancellation always terminate. A state change only
    /// terminates when the request kind is interested in it.
    pub(crate) fn resolve(&self, trigger: Trigger<'_>) -> Option<Vec<Message>> {
        match (&self.kind, trigger) {
            (_, Trigger::Cancel) => Some(vec![self.completion(ResultCode::Canceled, Payload::None)]),
            (_, Trigger::Deadline) => Some(vec![self.completion(ResultCode::Timeout, Payload::None)]),
            (RequestKind::CardInsertion { sources }, Trigger::Change(state, ChangeKind::Card)) => {
                if !state.card_inserted() || !self.binding.accepts(state.name()) {
                    return None;
                }
                let inserted = Message::event(
                    MessageType::ExecuteEvent,
                    self.key.service,
                    self.key.request,
                    EventId::MediaInserted,
                    Payload::None,
                );
                let data = card_data(*sources, state.atr());
                Some(vec![
                    inserted,
                    self.completion(ResultCode::Success, Payload::CardData(data)),
                ])
            }
            (RequestKind::CardInsertion { .. }, Trigger::Change(_, ChangeKind::DeviceList)) => None,
        }
    }

    fn completion(&self, result: ResultCode, payload: Payload) -> Message {
        let command = match self.kind {
            RequestKind::CardInsertion { .. } => CommandCode::ReadRawData,
        };
        Message::completion(
            MessageType::ExecuteComplete,
            self.key.service,
            self.key.request,
            command as u32,
            result,
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader_state::ReaderFlags;
    use crate::xfs::idc::DataStatus;
    use bytes::Bytes;

    fn request(binding: Arc<ReaderBinding>) -> PendingRequest {
        PendingRequest::card_insertion(
            RequestKey::new(1, 10),
            WindowHandle(5),
            Instant::now(),
            Some(Duration::from_secs(1)),
            DataSources::CHIP,
            binding,
        )
    }

    fn inserted(reader: &str) -> ReaderStateSnapshot {
        let mut state = ReaderStateSnapshot::new(reader, ReaderFlags::EMPTY);
        state.set_event(
            ReaderFlags::CHANGED | ReaderFlags::PRESENT,
            Bytes::from_static(&[0x3B, 0x8F]),
        );
        state
    }

    #[test]
    fn test_insertion_posts_event_then_completion() {
        let pending = request(Arc::new(ReaderBinding::new(1, Some("reader".into()))));
        let messages = pending
            .resolve(Trigger::Change(&inserted("reader"), ChangeKind::Card))
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_event(EventId::MediaInserted));
        assert_eq!(messages[1].kind, MessageType::ExecuteComplete);
        assert_eq!(messages[1].result.result, ResultCode::Success);
        assert_eq!(messages[1].result.request_id, 10);
        let Payload::CardData(data) = &messages[1].result.payload else {
            panic!("expected card data");
        };
        assert_eq!(data[0].status, DataStatus::Ok);
        assert_eq!(data[0].data.as_ref(), &[0x3B, 0x8F]);
    }

    #[test]
    fn test_other_reader_does_not_match() {
        let pending = request(Arc::new(ReaderBinding::new(1, Some("reader".into()))));
        assert!(!pending.matches(&inserted("other"), ChangeKind::Card));
    }

    #[test]
    fn test_unbound_request_matches_any_reader() {
        let pending = request(Arc::new(ReaderBinding::new(1, None)));
        assert!(pending.matches(&inserted("other"), ChangeKind::Card));
    }

    #[test]
    fn test_device_list_change_does_not_match() {
        let pending = request(Arc::new(ReaderBinding::new(1, None)));
        assert!(!pending.matches(&inserted("reader"), ChangeKind::DeviceList));
    }

    #[test]
    fn test_deadline_and_cancel_complete_once() {
        let pending = request(Arc::new(ReaderBinding::new(1, None)));

        let timeout = pending.resolve(Trigger::Deadline).unwrap();
        assert_eq!(timeout.len(), 1);
        assert_eq!(timeout[0].result.result, ResultCode::Timeout);

        let cancelled = pending.resolve(Trigger::Cancel).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].result.result, ResultCode::Canceled);
        assert_eq!(cancelled[0].result.code, CommandCode::ReadRawData as u32);
    }

    #[test]
    fn test_indefinite_timeout_is_far_away() {
        let now = Instant::now();
        let pending = PendingRequest::card_insertion(
            RequestKey::new(1, 1),
            WindowHandle(1),
            now,
            None,
            DataSources::CHIP,
            Arc::new(ReaderBinding::new(1, None)),
        );
        assert!(pending.deadline() >= now + Duration::from_secs(3600));
    }

    #[test]
    fn test_oversized_timeout_waits_indefinitely() {
        let now = Instant::now();
        let binding = Arc::new(ReaderBinding::new(1, None));
        let pending = PendingRequest::card_insertion(
            RequestKey::new(1, 1),
            WindowHandle(1),
            now,
            Some(Duration::MAX),
            DataSources::CHIP,
            Arc::clone(&binding),
        );
        let indefinite = PendingRequest::card_insertion(
            RequestKey::new(1, 2),
            WindowHandle(1),
            now,
            None,
            DataSources::CHIP,
            binding,
        );
        assert_eq!(pending.deadline(), indefinite.deadline());
    }
}
