//! Reader state snapshots exchanged with the resource manager

use bitflags::bitflags;
use bytes::Bytes;

/// Name of the pseudo reader that reports changes of the reader list
pub const PNP_NOTIFICATION: &str = r"\\?PnP?\Notification";

bitflags! {
    /// Reader state bits as reported by the resource manager.
    ///
    /// The upper 16 bits carry the event counter of the reader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReaderFlags: u32 {
        /// Application is unaware of the current state
        const UNAWARE = 0x0000;
        /// Ignore this reader
        const IGNORE = 0x0001;
        /// State differs from the state passed in
        const CHANGED = 0x0002;
        /// Reader name is not recognized
        const UNKNOWN = 0x0004;
        /// State of the reader is unavailable
        const UNAVAILABLE = 0x0008;
        /// No card in the reader
        const EMPTY = 0x0010;
        /// A card is in the reader
        const PRESENT = 0x0020;
        /// Card ATR matches a target card
        const ATRMATCH = 0x0040;
        /// Card is used exclusively by another application
        const EXCLUSIVE = 0x0080;
        /// Card is in use by one or more applications
        const INUSE = 0x0100;
        /// Card is unresponsive
        const MUTE = 0x0200;
        /// Card is present but unpowered
        const UNPOWERED = 0x0400;

        // Event counter and any bits the resource manager adds later
        const _ = !0;
    }
}

impl ReaderFlags {
    const STATE_MASK: u32 = 0xFFFF;

    /// State bits without the event counter
    pub const fn state(self) -> Self {
        Self::from_bits_retain(self.bits() & Self::STATE_MASK)
    }

    /// Event counter maintained by the resource manager
    pub const fn event_count(self) -> u16 {
        (self.bits() >> 16) as u16
    }
}

/// Whether a change concerns the set of attached readers or the card in one reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A reader was attached or detached
    DeviceList,
    /// The card state of an existing reader changed
    Card,
}

/// Point-in-time state of one reader, or of the reader list pseudo reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStateSnapshot {
    name: String,
    current: ReaderFlags,
    event: ReaderFlags,
    atr: Bytes,
}

impl ReaderStateSnapshot {
    /// Create a snapshot for a reader with a known baseline state
    pub fn new(name: impl Into<String>, current: ReaderFlags) -> Self {
        Self {
            name: name.into(),
            current,
            event: ReaderFlags::UNAWARE,
            atr: Bytes::new(),
        }
    }

    /// Create a snapshot for a reader whose state is not known yet
    pub fn unaware(name: impl Into<String>) -> Self {
        Self::new(name, ReaderFlags::UNAWARE)
    }

    /// Create the reader list pseudo reader entry
    pub fn pnp() -> Self {
        Self::unaware(PNP_NOTIFICATION)
    }

    /// Whether this is the reader list pseudo reader
    pub fn is_pnp(&self) -> bool {
        self.name == PNP_NOTIFICATION
    }

    /// Kind of change this entry reports
    pub fn change_kind(&self) -> ChangeKind {
        if self.is_pnp() {
            ChangeKind::DeviceList
        } else {
            ChangeKind::Card
        }
    }

    /// Reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Baseline state the wait was issued with
    pub const fn current(&self) -> ReaderFlags {
        self.current
    }

    /// State reported by the last wait
    pub const fn event(&self) -> ReaderFlags {
        self.event
    }

    /// ATR of the card in the reader
    pub const fn atr(&self) -> &Bytes {
        &self.atr
    }

    /// Record the outcome of a wait
    pub fn set_event(&mut self, event: ReaderFlags, atr: Bytes) {
        self.event = event;
        self.atr = atr;
    }

    /// Whether the last wait reported a change for this entry
    pub const fn changed(&self) -> bool {
        self.event.contains(ReaderFlags::CHANGED)
    }

    /// State bits that differ between the baseline and the reported state
    pub const fn diff(&self) -> ReaderFlags {
        self.current
            .state()
            .symmetric_difference(self.event.state())
            .difference(ReaderFlags::CHANGED)
    }

    /// Use the reported state as the baseline for the next wait
    pub const fn sync(&mut self) {
        self.current = self.event;
    }

    /// Whether a card is in the reader according to the last wait
    pub const fn card_present(&self) -> bool {
        self.event.contains(ReaderFlags::PRESENT)
    }

    /// Whether a card appeared relative to the baseline. A card that was
    /// removed and put back between two waits leaves `PRESENT` set but moves
    /// the event counter.
    pub const fn card_inserted(&self) -> bool {
        self.changed()
            && self.card_present()
            && (!self.current.contains(ReaderFlags::PRESENT) || self.card_replaced())
    }

    /// Whether the card present in the baseline was swapped since
    pub const fn card_replaced(&self) -> bool {
        self.changed()
            && self.card_present()
            && self.current.contains(ReaderFlags::PRESENT)
            && self.current.event_count() != self.event.event_count()
    }

    /// Whether a card disappeared relative to the baseline
    pub const fn card_removed(&self) -> bool {
        self.changed() && self.current.contains(ReaderFlags::PRESENT) && !self.card_present()
    }

    /// Whether the reader is gone or its state cannot be read
    pub const fn unavailable(&self) -> bool {
        self.event
            .intersects(ReaderFlags::UNAVAILABLE.union(ReaderFlags::UNKNOWN))
    }

    /// Event counter reported by the last wait
    pub const fn event_count(&self) -> u16 {
        self.event.event_count()
    }
}
