//! Boundary to the smart card resource manager
//!
//! The engine never talks to PC/SC directly. Everything it needs from the
//! resource manager goes through [`ResourceManager`] and [`CardConnection`],
//! which keeps the coordination logic testable without hardware.

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::ScardError;
use crate::reader_state::ReaderStateSnapshot;

/// Outcome of a combined wait on reader states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one entry reported a change
    Changed,
    /// The timeout elapsed without a change
    TimedOut,
    /// The wait was interrupted by [`ResourceManager::cancel_wait`]
    Cancelled,
}

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Exclusive access to the card
    Exclusive,
    /// Shared access to the card
    Shared,
}

/// What to do with the card when a connection is reset or released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the card as is
    Leave,
    /// Warm reset
    Reset,
    /// Power the card down
    Unpower,
    /// Eject the card
    Eject,
}

/// Transmission protocol negotiated with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// T=0
    T0,
    /// T=1
    T1,
    /// Raw
    Raw,
}

bitflags! {
    /// Card state reported by a connection status query
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CardState: u32 {
        /// State is unknown
        const UNKNOWN = 0x0001;
        /// No card in the reader
        const ABSENT = 0x0002;
        /// Card is present
        const PRESENT = 0x0004;
        /// Card is in position for use
        const SWALLOWED = 0x0008;
        /// Card is powered
        const POWERED = 0x0010;
        /// Card is ready for protocol negotiation
        const NEGOTIABLE = 0x0020;
        /// A protocol has been negotiated
        const SPECIFIC = 0x0040;
    }
}

/// Status of a card connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardStatus {
    /// Card state
    pub state: CardState,
    /// Active protocol, if any
    pub protocol: Option<Protocol>,
    /// Answer to reset
    pub atr: Bytes,
}

/// An open connection to the card in one reader
pub trait CardConnection: Send + 'static {
    /// Query the card state, protocol and ATR
    fn status(&mut self) -> Result<CardStatus, ScardError>;

    /// Exchange one APDU with the card
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, ScardError>;

    /// Take exclusive access to the card
    fn lock(&mut self) -> Result<(), ScardError>;

    /// Release exclusive access
    fn unlock(&mut self) -> Result<(), ScardError>;

    /// Re-establish the connection, applying `initialization` to the card
    fn reconnect(&mut self, initialization: Disposition) -> Result<(), ScardError>;
}

/// The smart card resource manager
pub trait ResourceManager: Send + Sync + 'static {
    /// Connection type produced by [`ResourceManager::connect`]
    type Card: CardConnection;

    /// Names of the readers currently attached
    fn list_readers(&self) -> Result<Vec<String>, ScardError>;

    /// Block until one of `states` differs from its baseline, the timeout
    /// elapses or the wait is cancelled.
    ///
    /// `None` waits indefinitely. On [`WaitStatus::Changed`] every entry's
    /// event state is updated.
    fn wait_for_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderStateSnapshot],
    ) -> Result<WaitStatus, ScardError>;

    /// Interrupt a blocking [`ResourceManager::wait_for_change`] from another thread
    fn cancel_wait(&self) -> Result<(), ScardError>;

    /// Connect to the card in `reader`
    fn connect(&self, reader: &str, mode: ShareMode) -> Result<Self::Card, ScardError>;
}
