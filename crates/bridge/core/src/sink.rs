//! Delivery of messages to client windows

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::request::WindowHandle;
use crate::xfs::Message;

/// Destination for completion and event messages
pub trait MessageSink: Send + Sync + 'static {
    /// Post `message` to `window` without waiting for it to be handled
    fn post(&self, window: WindowHandle, message: Message);
}

// Closures can be used as sinks
impl<F> MessageSink for F
where
    F: Fn(WindowHandle, Message) + Send + Sync + 'static,
{
    fn post(&self, window: WindowHandle, message: Message) {
        self(window, message)
    }
}

/// Sender half of a window queue
pub type MessageSender = Sender<Message>;
/// Receiver half of a window queue
pub type MessageReceiver = Receiver<Message>;

/// Sink that backs every window with a channel
#[derive(Debug, Default)]
pub struct ChannelSink {
    windows: RwLock<HashMap<WindowHandle, MessageSender>>,
    next: AtomicU64,
}

impl ChannelSink {
    /// Create a sink without windows
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a window and return its handle and message queue
    pub fn open_window(&self) -> (WindowHandle, MessageReceiver) {
        let window = WindowHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = unbounded();
        self.windows.write().insert(window, sender);
        (window, receiver)
    }

    /// Destroy a window; later posts to it are dropped
    pub fn close_window(&self, window: WindowHandle) -> bool {
        self.windows.write().remove(&window).is_some()
    }

    /// Whether `window` exists
    pub fn is_window(&self, window: WindowHandle) -> bool {
        self.windows.read().contains_key(&window)
    }
}

impl MessageSink for ChannelSink {
    fn post(&self, window: WindowHandle, message: Message) {
        let windows = self.windows.read();
        let Some(sender) = windows.get(&window) else {
            warn!(?window, kind = ?message.kind, "Dropping message for unknown window");
            return;
        };

        trace!(?window, kind = ?message.kind, result = %message.result.result, "Posting message");
        if sender.send(message).is_err() {
            warn!(?window, "Window queue is closed");
        }
    }
}
