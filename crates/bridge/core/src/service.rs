//! Logical service sessions

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::binding::ReaderBinding;
use crate::error::{BridgeError, ScardError};
use crate::events::EventNotifier;
use crate::reader_state::{ChangeKind, ReaderStateSnapshot};
use crate::request::{ServiceHandle, WindowHandle};
use crate::resource::{CardConnection, Disposition, Protocol, ResourceManager};
use crate::settings::{BridgeConfig, Settings};
use crate::sink::MessageSink;
use crate::xfs::idc::{
    CARD_READ_POSITION, CardData, ChipIo, ChipProtocols, DataSources, DeviceState, EventId,
    IdcCaps, IdcStatus, PowerAction, card_data,
};
use crate::xfs::{EventClass, Message, MessageType, Payload};

/// What the service last saw of its reader
#[derive(Debug, Clone, Copy)]
struct Observed {
    present: bool,
    available: bool,
}

/// A logical card reader session bound to at most one physical reader
pub struct Service<R: ResourceManager> {
    handle: ServiceHandle,
    settings: RwLock<Settings>,
    binding: Arc<ReaderBinding>,
    resources: Arc<R>,
    card: Mutex<Option<R::Card>>,
    events: Mutex<EventNotifier>,
    observed: Mutex<Observed>,
    locked: AtomicBool,
    sink: Arc<dyn MessageSink>,
}

impl<R: ResourceManager> fmt::Debug for Service<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("handle", &self.handle)
            .field("settings", &*self.settings.read())
            .field("binding", &self.binding)
            .field("connected", &self.card.lock().is_some())
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<R: ResourceManager> Service<R> {
    /// Create a session. The card is connected on first use.
    pub fn new(
        handle: ServiceHandle,
        settings: Settings,
        resources: Arc<R>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let binding = Arc::new(ReaderBinding::new(handle, settings.reader_name.clone()));
        info!(
            service = handle,
            logical = %settings.logical_name,
            provider = %settings.provider_name,
            reader = ?settings.reader_name,
            "Service opened"
        );
        Self {
            handle,
            settings: RwLock::new(settings),
            binding,
            resources,
            card: Mutex::new(None),
            events: Mutex::new(EventNotifier::new()),
            observed: Mutex::new(Observed {
                present: false,
                available: true,
            }),
            locked: AtomicBool::new(false),
            sink,
        }
    }

    /// Service handle
    pub const fn handle(&self) -> ServiceHandle {
        self.handle
    }

    /// Reader binding shared with pending requests
    pub const fn binding(&self) -> &Arc<ReaderBinding> {
        &self.binding
    }

    /// Current settings
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Re-read settings from `config`
    pub fn reread(&self, config: &BridgeConfig) {
        let mut settings = self.settings.write();
        settings.reread(config);
        self.binding.rebind(settings.reader_name.clone());
    }

    /// Change the trace level
    pub fn set_trace_level(&self, level: u32) {
        debug!(service = self.handle, level, "Trace level changed");
        self.settings.write().trace_level = level;
    }

    /// Whether the service holds the card exclusively
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Subscribe `window` to event classes
    pub fn register(&self, window: WindowHandle, classes: EventClass) {
        self.events.lock().add(window, classes);
    }

    /// Unsubscribe windows from event classes. Returns whether anything was registered.
    pub fn deregister(&self, window: Option<WindowHandle>, classes: EventClass) -> bool {
        self.events.lock().remove(window, classes)
    }

    /// React to a reader state change before pending requests see it.
    ///
    /// Binds an unbound service to the reader a card appeared in, reports
    /// card removal and reader availability to subscribers.
    pub fn notify(&self, state: &ReaderStateSnapshot, kind: ChangeKind) {
        if kind == ChangeKind::DeviceList {
            return;
        }
        if state.card_inserted() {
            self.binding.bind(state.name());
        }
        if !self.binding.is_bound_to(state.name()) {
            return;
        }

        let mut observed = self.observed.lock();

        let available = !state.unavailable();
        if available != observed.available {
            observed.available = available;
            let device = if available {
                DeviceState::Online
            } else {
                DeviceState::NoDevice
            };
            info!(service = self.handle, reader = state.name(), ?device, "Reader availability changed");
            self.post_event(
                MessageType::SystemEvent,
                EventId::DeviceStatus,
                Payload::DeviceStatus {
                    reader: state.name().to_owned(),
                    state: device,
                },
            );
        }

        let present = state.card_present();
        // A swapped card invalidates the connection to the old one
        if observed.present && (!present || state.card_replaced()) {
            debug!(service = self.handle, reader = state.name(), "Card removed");
            self.disconnect();
            self.post_event(MessageType::ServiceEvent, EventId::MediaRemoved, Payload::None);
        }
        observed.present = present;
    }

    /// Device status
    pub fn status(&self) -> Result<IdcStatus, ScardError> {
        if !self.observed.lock().available {
            return Ok(IdcStatus::without_card(DeviceState::NoDevice));
        }
        if !self.binding.is_bound() {
            return Ok(IdcStatus::without_card(DeviceState::Online));
        }

        match self.with_card(|card| card.status()) {
            Ok(status) => Ok(IdcStatus::from_card(&status)),
            Err(ScardError::NoSmartcard | ScardError::RemovedCard) => {
                Ok(IdcStatus::without_card(DeviceState::Online))
            }
            Err(e) => Err(e),
        }
    }

    /// Device capabilities
    pub fn caps(&self) -> IdcCaps {
        IdcCaps::pcsc(self.settings.read().workarounds.can_eject)
    }

    /// Take exclusive access to the card
    pub fn lock(&self) -> Result<(), ScardError> {
        if self.is_locked() {
            return Ok(());
        }
        self.with_card(|card| card.lock())?;
        self.locked.store(true, Ordering::Release);
        debug!(service = self.handle, "Service locked");
        Ok(())
    }

    /// Release exclusive access
    pub fn unlock(&self) -> Result<(), BridgeError> {
        if !self.is_locked() {
            return Err(BridgeError::NotLocked(self.handle));
        }
        let result = self.with_card(|card| card.unlock());
        self.locked.store(false, Ordering::Release);
        debug!(service = self.handle, "Service unlocked");
        Ok(result?)
    }

    /// Read the requested data sources from the card in the reader
    pub fn read(&self, sources: DataSources) -> Result<Vec<CardData>, ScardError> {
        let status = self.with_card(|card| card.status())?;
        Ok(card_data(sources, &status.atr))
    }

    /// Exchange an APDU with the chip
    pub fn chip_io(&self, command: &[u8]) -> Result<ChipIo, ScardError> {
        let correct = self.settings.read().workarounds.correct_chip_io;
        self.with_card(|card| {
            let protocol = card.status()?.protocol;
            let command = if correct && protocol == Some(Protocol::T0) {
                strip_t0_le(command)
            } else {
                command
            };

            trace!(service = self.handle, command = %hex::encode(command), "Chip command");
            let response = card.transmit(command)?;
            trace!(service = self.handle, response = %hex::encode(&response), "Chip response");

            Ok(ChipIo {
                protocol: ChipProtocols::from_protocol(protocol),
                data: response,
            })
        })
    }

    /// Change chip power. Returns the ATR after the action.
    pub fn chip_power(&self, action: PowerAction) -> Result<Bytes, ScardError> {
        self.with_card(|card| {
            card.reconnect(action.disposition())?;
            if action == PowerAction::Off {
                return Ok(Bytes::new());
            }
            Ok(card.status()?.atr)
        })
    }

    /// Reset the device. Reports the card to subscribers when one is present.
    pub fn reset(&self) -> Result<bool, ScardError> {
        if !self.binding.is_bound() {
            return Ok(false);
        }
        match self.with_card(|card| card.reconnect(Disposition::Reset)) {
            Ok(()) => {
                self.post_event(
                    MessageType::ServiceEvent,
                    EventId::MediaDetected,
                    Payload::MediaDetected(CARD_READ_POSITION),
                );
                Ok(true)
            }
            Err(ScardError::NoSmartcard | ScardError::RemovedCard) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop the card connection
    pub fn disconnect(&self) {
        if self.card.lock().take().is_some() {
            debug!(service = self.handle, "Card connection closed");
        }
        self.locked.store(false, Ordering::Release);
    }

    fn with_card<T>(
        &self,
        f: impl FnOnce(&mut R::Card) -> Result<T, ScardError>,
    ) -> Result<T, ScardError> {
        let mut card = self.card.lock();

        if card.is_none() {
            let reader = self.binding.reader().ok_or(ScardError::NoSmartcard)?;
            let mode = self.settings.read().share_mode();
            debug!(service = self.handle, reader, ?mode, "Connecting to card");
            *card = Some(self.resources.connect(&reader, mode)?);
        }
        let Some(connection) = card.as_mut() else {
            return Err(ScardError::NoSmartcard);
        };

        let result = f(connection);
        if let Err(e) = &result {
            if e.drops_connection() {
                debug!(service = self.handle, error = %e, "Dropping card connection");
                *card = None;
                self.locked.store(false, Ordering::Release);
            }
        }
        result
    }

    fn post_event(&self, kind: MessageType, event: EventId, payload: Payload) {
        let message = Message::event(kind, self.handle, 0, event, payload);
        let notified = self.events.lock().notify(&*self.sink, &message);
        trace!(service = self.handle, ?event, notified, "Event posted");
    }
}

/// Drop the trailing Le of a case 4 shaped command (`CLA INS P1 P2 Lc data Le`),
/// which T=0 cannot carry.
fn strip_t0_le(command: &[u8]) -> &[u8] {
    if command.len() > 5 {
        let lc = usize::from(command[4]);
        if lc > 0 && command.len() == 5 + lc + 1 {
            return &command[..5 + lc];
        }
    }
    command
}
