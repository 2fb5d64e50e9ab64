//! Resource manager backed by the PC/SC daemon

use std::ffi::CString;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use pcsc::{Context, Protocols, ReaderState, Scope, State};
use tracing::{debug, trace};
use xfs_bridge_core::{
    ReaderFlags, ReaderStateSnapshot, ResourceManager, ScardError, ShareMode, WaitStatus,
};

use crate::card::PcscCard;
use crate::config::share_mode;
use crate::error::scard_error;

/// PC/SC resource manager.
///
/// Waiting happens on a context of its own so card connections are not held
/// up by a blocked status change call.
pub struct PcscResourceManager {
    /// Context for card connections
    context: Context,
    /// Context for reader enumeration, status changes and cancellation
    monitor: Context,
}

impl fmt::Debug for PcscResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscResourceManager").finish_non_exhaustive()
    }
}

impl PcscResourceManager {
    /// Establish contexts with the PC/SC daemon at user scope
    pub fn new() -> Result<Self, ScardError> {
        let context = Context::establish(Scope::User).map_err(scard_error)?;
        let monitor = Context::establish(Scope::User).map_err(scard_error)?;
        debug!("PC/SC contexts established");
        Ok(Self { context, monitor })
    }
}

/// Native state to wait with. The baseline keeps its event counter, so a
/// remove and insert between two waits changes the counter and is reported
/// as an insertion.
fn native_state(snapshot: &ReaderStateSnapshot) -> Result<ReaderState, ScardError> {
    let name = CString::new(snapshot.name()).map_err(|_| ScardError::UnknownReader)?;
    let current = snapshot.current().difference(ReaderFlags::CHANGED);
    Ok(ReaderState::new(name, State::from_bits_retain(current.bits() as _)))
}

/// Event state of a native reader state, event counter included
fn event_flags(native: &ReaderState) -> ReaderFlags {
    let state = native.event_state().bits() as u32 & 0xFFFF;
    let count = (native.event_count() as u32) << 16;
    ReaderFlags::from_bits_retain(state | count)
}

impl ResourceManager for PcscResourceManager {
    type Card = PcscCard;

    fn list_readers(&self) -> Result<Vec<String>, ScardError> {
        match self.monitor.list_readers_owned() {
            Ok(readers) => Ok(readers
                .into_iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(scard_error(e)),
        }
    }

    fn wait_for_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderStateSnapshot],
    ) -> Result<WaitStatus, ScardError> {
        let mut natives = states
            .iter()
            .map(native_state)
            .collect::<Result<Vec<_>, _>>()?;

        trace!(readers = natives.len(), ?timeout, "Waiting for status change");
        match self.monitor.get_status_change(timeout, &mut natives) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => return Ok(WaitStatus::TimedOut),
            Err(pcsc::Error::Cancelled) => return Ok(WaitStatus::Cancelled),
            Err(e) => return Err(scard_error(e)),
        }

        for (snapshot, native) in states.iter_mut().zip(&natives) {
            snapshot.set_event(event_flags(native), Bytes::copy_from_slice(native.atr()));
        }
        Ok(WaitStatus::Changed)
    }

    fn cancel_wait(&self) -> Result<(), ScardError> {
        self.monitor.cancel().map_err(scard_error)
    }

    fn connect(&self, reader: &str, mode: ShareMode) -> Result<PcscCard, ScardError> {
        let name = CString::new(reader).map_err(|_| ScardError::UnknownReader)?;
        let card = self
            .context
            .connect(&name, share_mode(mode), Protocols::ANY)
            .map_err(scard_error)?;
        debug!(reader, ?mode, "Connected to card");
        Ok(PcscCard::new(card, reader, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_state_drops_changed() {
        let snapshot = ReaderStateSnapshot::new(
            "Reader A",
            ReaderFlags::PRESENT | ReaderFlags::CHANGED | ReaderFlags::INUSE,
        );
        let native = native_state(&snapshot).unwrap();
        assert_eq!(native.name().to_str().unwrap(), "Reader A");
        assert!(native.current_state().contains(State::PRESENT | State::INUSE));
        assert!(!native.current_state().contains(State::CHANGED));
    }

    #[test]
    fn test_native_state_rejects_nul() {
        let snapshot = ReaderStateSnapshot::unaware("bad\0name");
        assert!(matches!(native_state(&snapshot), Err(ScardError::UnknownReader)));
    }
}
