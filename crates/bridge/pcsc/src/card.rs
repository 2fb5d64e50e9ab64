//! Card connection over PC/SC

use std::fmt;

use bytes::Bytes;
use pcsc::{Card, Protocols, Status};
use tracing::{debug, trace, warn};
use xfs_bridge_core::{
    CardConnection, CardState, CardStatus, Disposition, Protocol, ScardError, ShareMode,
};

use crate::config::{disposition, share_mode};
use crate::error::scard_error;

/// Connection to the card in one reader
pub struct PcscCard {
    /// Card handle, taken on drop
    card: Option<Card>,
    /// Reader name
    reader: String,
    /// Share mode the connection was opened with
    mode: ShareMode,
}

impl fmt::Debug for PcscCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscCard")
            .field("reader", &self.reader)
            .field("connected", &self.card.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

impl PcscCard {
    pub(crate) fn new(card: Card, reader: &str, mode: ShareMode) -> Self {
        Self {
            card: Some(card),
            reader: reader.to_owned(),
            mode,
        }
    }

    /// Reader name
    pub fn reader(&self) -> &str {
        &self.reader
    }

    fn card(&mut self) -> Result<&mut Card, ScardError> {
        self.card.as_mut().ok_or(ScardError::InvalidHandle)
    }

    fn reconnect_with(
        &mut self,
        mode: ShareMode,
        initialization: Disposition,
    ) -> Result<(), ScardError> {
        debug!(reader = %self.reader, ?mode, ?initialization, "Reconnecting card");
        self.card()?
            .reconnect(share_mode(mode), Protocols::ANY, disposition(initialization))
            .map_err(scard_error)
    }
}

/// Translate PC/SC card status bits
fn card_state(status: Status) -> CardState {
    [
        (Status::UNKNOWN, CardState::UNKNOWN),
        (Status::ABSENT, CardState::ABSENT),
        (Status::PRESENT, CardState::PRESENT),
        (Status::SWALLOWED, CardState::SWALLOWED),
        (Status::POWERED, CardState::POWERED),
        (Status::NEGOTIABLE, CardState::NEGOTIABLE),
        (Status::SPECIFIC, CardState::SPECIFIC),
    ]
    .into_iter()
    .filter(|(native, _)| status.contains(*native))
    .fold(CardState::empty(), |state, (_, flag)| state | flag)
}

const fn protocol(protocol: pcsc::Protocol) -> Protocol {
    match protocol {
        pcsc::Protocol::T0 => Protocol::T0,
        pcsc::Protocol::T1 => Protocol::T1,
        pcsc::Protocol::RAW => Protocol::Raw,
    }
}

impl CardConnection for PcscCard {
    fn status(&mut self) -> Result<CardStatus, ScardError> {
        let status = self.card()?.status2_owned().map_err(scard_error)?;
        Ok(CardStatus {
            state: card_state(status.status()),
            protocol: status.protocol2().map(protocol),
            atr: Bytes::copy_from_slice(status.atr()),
        })
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, ScardError> {
        trace!(reader = %self.reader, command = %hex::encode(command), "Transmitting");
        let card = self.card()?;

        // Allocate a buffer for the response
        let mut response = [0u8; pcsc::MAX_BUFFER_SIZE];
        match card.transmit(command, &mut response) {
            Ok(response) => {
                trace!(reader = %self.reader, response = %hex::encode(response), "Received response");
                Ok(Bytes::copy_from_slice(response))
            }
            Err(e) => {
                // The handle is useless once the card is gone
                if matches!(e, pcsc::Error::RemovedCard | pcsc::Error::InvalidHandle) {
                    self.card = None;
                }
                Err(scard_error(e))
            }
        }
    }

    fn lock(&mut self) -> Result<(), ScardError> {
        self.reconnect_with(ShareMode::Exclusive, Disposition::Leave)
    }

    fn unlock(&mut self) -> Result<(), ScardError> {
        self.reconnect_with(self.mode, Disposition::Leave)
    }

    fn reconnect(&mut self, initialization: Disposition) -> Result<(), ScardError> {
        self.reconnect_with(self.mode, initialization)
    }
}

impl Drop for PcscCard {
    fn drop(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(pcsc::Disposition::LeaveCard) {
                warn!(reader = %self.reader, "Failed to disconnect card: {}", e);
            }
        }
    }
}
