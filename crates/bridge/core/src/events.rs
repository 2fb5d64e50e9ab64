//! Event subscriptions of a logical service

use std::collections::BTreeMap;

use tracing::trace;

use crate::request::WindowHandle;
use crate::sink::MessageSink;
use crate::xfs::{EventClass, Message};

/// Windows registered for events of one service, with their class masks
#[derive(Debug, Default, Clone)]
pub struct EventNotifier {
    subscribers: BTreeMap<WindowHandle, EventClass>,
}

impl EventNotifier {
    /// Create a notifier without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `window` to `classes`, widening an existing subscription.
    /// An empty set subscribes to every class.
    pub fn add(&mut self, window: WindowHandle, classes: EventClass) {
        let classes = if classes.is_empty() {
            EventClass::all()
        } else {
            classes
        };
        *self.subscribers.entry(window).or_insert(EventClass::empty()) |= classes;
    }

    /// Unsubscribe `window` (every window if `None`) from `classes` (every
    /// class if empty). Subscribers left without classes are dropped.
    ///
    /// Returns whether any matching subscription existed.
    pub fn remove(&mut self, window: Option<WindowHandle>, classes: EventClass) -> bool {
        let classes = if classes.is_empty() {
            EventClass::all()
        } else {
            classes
        };

        let mut found = false;
        self.subscribers.retain(|subscriber, mask| {
            if window.is_some_and(|window| window != *subscriber) {
                return true;
            }
            found |= mask.intersects(classes);
            mask.remove(classes);
            !mask.is_empty()
        });
        found
    }

    /// Post `message` to every window subscribed to its event class.
    /// Returns the number of windows notified.
    pub fn notify(&self, sink: &dyn MessageSink, message: &Message) -> usize {
        let Some(class) = message.kind.event_class() else {
            return 0;
        };

        let mut notified = 0;
        for (window, mask) in &self.subscribers {
            if mask.contains(class) {
                trace!(?window, ?class, "Notifying subscriber");
                sink.post(*window, message.clone());
                notified += 1;
            }
        }
        notified
    }

    /// Classes `window` is subscribed to
    pub fn classes(&self, window: WindowHandle) -> EventClass {
        self.subscribers
            .get(&window)
            .copied()
            .unwrap_or(EventClass::empty())
    }

    /// Whether no window is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfs::idc::EventId;
    use crate::xfs::{MessageType, Payload};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn event(kind: MessageType) -> Message {
        Message::event(kind, 1, 0, EventId::MediaRemoved, Payload::None)
    }

    #[test]
    fn test_add_widens_mask() {
        let mut events = EventNotifier::new();
        let window = WindowHandle(1);
        events.add(window, EventClass::SERVICE);
        events.add(window, EventClass::SYSTEM);
        assert_eq!(events.classes(window), EventClass::SERVICE | EventClass::SYSTEM);
    }

    #[test]
    fn test_empty_mask_means_all_classes() {
        let mut events = EventNotifier::new();
        events.add(WindowHandle(1), EventClass::empty());
        assert_eq!(events.classes(WindowHandle(1)), EventClass::all());

        assert!(events.remove(Some(WindowHandle(1)), EventClass::empty()));
        assert!(events.is_empty());
    }

    #[test]
    fn test_remove_narrows_and_drops() {
        let mut events = EventNotifier::new();
        events.add(WindowHandle(1), EventClass::SERVICE | EventClass::USER);
        events.add(WindowHandle(2), EventClass::SERVICE);

        assert!(events.remove(None, EventClass::SERVICE));
        assert_eq!(events.classes(WindowHandle(1)), EventClass::USER);
        assert_eq!(events.classes(WindowHandle(2)), EventClass::empty());
        assert!(!events.remove(Some(WindowHandle(2)), EventClass::SERVICE));
    }

    #[test]
    fn test_notify_filters_by_class() {
        let posted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&posted);
        let sink = move |window: WindowHandle, _: Message| log.lock().push(window);

        let mut events = EventNotifier::new();
        events.add(WindowHandle(1), EventClass::SERVICE);
        events.add(WindowHandle(2), EventClass::SYSTEM);
        events.add(WindowHandle(3), EventClass::all());

        assert_eq!(events.notify(&sink, &event(MessageType::ServiceEvent)), 2);
        assert_eq!(*posted.lock(), vec![WindowHandle(1), WindowHandle(3)]);

        assert_eq!(
            events.notify(&sink, &event(MessageType::ExecuteComplete)),
            0
        );
    }
}
