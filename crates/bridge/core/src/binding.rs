//! Reader binding shared between a service and its pending requests

use parking_lot::RwLock;
use tracing::info;

use crate::request::ServiceHandle;

/// The physical reader a logical service works with.
///
/// A service configured without a reader name starts unbound and binds to
/// the first reader in which a card is inserted.
#[derive(Debug)]
pub struct ReaderBinding {
    service: ServiceHandle,
    reader: RwLock<Option<String>>,
}

impl ReaderBinding {
    /// Create a binding, empty names leave it unbound
    pub fn new(service: ServiceHandle, reader: Option<String>) -> Self {
        Self {
            service,
            reader: RwLock::new(reader.filter(|name| !name.is_empty())),
        }
    }

    /// Bound reader name
    pub fn reader(&self) -> Option<String> {
        self.reader.read().clone()
    }

    /// Whether a reader has been chosen
    pub fn is_bound(&self) -> bool {
        self.reader.read().is_some()
    }

    /// Whether the binding is to `name`
    pub fn is_bound_to(&self, name: &str) -> bool {
        self.reader.read().as_deref() == Some(name)
    }

    /// Whether events of `name` concern this binding
    pub fn accepts(&self, name: &str) -> bool {
        self.reader.read().as_deref().is_none_or(|bound| bound == name)
    }

    /// Bind to `name` unless already bound. Returns whether the binding changed.
    pub fn bind(&self, name: &str) -> bool {
        let mut reader = self.reader.write();
        if reader.is_some() {
            return false;
        }
        info!(service = self.service, reader = name, "Service bound to reader");
        *reader = Some(name.to_owned());
        true
    }

    /// Replace the configured reader after settings were re-read
    pub fn rebind(&self, reader: Option<String>) {
        let reader = reader.filter(|name| !name.is_empty());
        let mut current = self.reader.write();
        if reader.is_some() && *current != reader {
            info!(service = self.service, reader = ?reader, "Service reader changed");
            *current = reader;
        }
    }
}
