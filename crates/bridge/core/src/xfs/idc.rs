//! Identification card (IDC) service class model

use bitflags::bitflags;
use bytes::Bytes;

use crate::resource::{CardState, CardStatus, Disposition, Protocol};

/// Commands accepted by `WFPExecute` for the IDC class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    /// Read magnetic tracks
    ReadTrack = 201,
    /// Write a magnetic track
    WriteTrack = 202,
    /// Eject the card
    EjectCard = 203,
    /// Retain the card
    RetainCard = 204,
    /// Reset the retain counter
    ResetCount = 205,
    /// Load a CIM86 key
    SetKey = 206,
    /// Wait for a card and read the requested data sources
    ReadRawData = 207,
    /// Write raw track data
    WriteRawData = 208,
    /// Exchange an APDU with the chip
    ChipIo = 209,
    /// Reset the device
    Reset = 210,
    /// Change chip power
    ChipPower = 211,
    /// Parse previously read data
    ParseData = 212,
}

impl CommandCode {
    /// Look up a raw command code
    pub const fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            201 => Self::ReadTrack,
            202 => Self::WriteTrack,
            203 => Self::EjectCard,
            204 => Self::RetainCard,
            205 => Self::ResetCount,
            206 => Self::SetKey,
            207 => Self::ReadRawData,
            208 => Self::WriteRawData,
            209 => Self::ChipIo,
            210 => Self::Reset,
            211 => Self::ChipPower,
            212 => Self::ParseData,
            _ => return None,
        })
    }
}

/// Categories accepted by `WFPGetInfo` for the IDC class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InfoCategory {
    /// Device status
    Status = 201,
    /// Device capabilities
    Capabilities = 202,
    /// Names of defined forms
    FormList = 203,
    /// Details of one form
    QueryForm = 204,
}

impl InfoCategory {
    /// Look up a raw category
    pub const fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            201 => Self::Status,
            202 => Self::Capabilities,
            203 => Self::FormList,
            204 => Self::QueryForm,
            _ => return None,
        })
    }
}

/// Event identifiers posted outside of direct request completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventId {
    /// System event: device status changed
    DeviceStatus = 4,
    /// Execute event: a card was inserted during a read request
    MediaInserted = 203,
    /// Service event: the card was removed
    MediaRemoved = 204,
    /// Service event: a card was detected during reset
    MediaDetected = 209,
}

bitflags! {
    /// Data sources requested by `WFS_CMD_IDC_READ_RAW_DATA`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataSources: u16 {
        /// Track 1
        const TRACK1 = 0x0001;
        /// Track 2
        const TRACK2 = 0x0002;
        /// Track 3
        const TRACK3 = 0x0004;
        /// Chip answer to reset
        const CHIP = 0x0008;
    }
}

/// Status of one element of a read result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Data read successfully
    Ok,
    /// Source not supported by the device
    SourceNotSupp,
    /// No data for the source
    Missing,
}

/// One element of the card data list returned by a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardData {
    /// Source the data was read from
    pub source: DataSources,
    /// Read status
    pub status: DataStatus,
    /// Raw data
    pub data: Bytes,
}

/// Build the card data list for a read request from the chip ATR.
///
/// Magnetic tracks are reported as unsupported.
pub fn card_data(sources: DataSources, atr: &Bytes) -> Vec<CardData> {
    sources
        .iter()
        .map(|source| {
            if source == DataSources::CHIP {
                let status = if atr.is_empty() {
                    DataStatus::Missing
                } else {
                    DataStatus::Ok
                };
                CardData {
                    source,
                    status,
                    data: atr.clone(),
                }
            } else {
                CardData {
                    source,
                    status: DataStatus::SourceNotSupp,
                    data: Bytes::new(),
                }
            }
        })
        .collect()
}

/// Overall device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DeviceState {
    /// Online and operational
    Online = 0,
    /// Offline
    Offline = 1,
    /// Powered off
    PowerOff = 2,
    /// Not present
    NoDevice = 3,
    /// Hardware error
    HwError = 4,
    /// User error
    UserError = 5,
    /// Busy
    Busy = 6,
}

/// Media (card) state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MediaState {
    /// Card in the reader
    Present = 1,
    /// No card
    NotPresent = 2,
    /// Card jammed
    Jammed = 3,
    /// Media detection not supported
    NotSupp = 4,
    /// State unknown
    Unknown = 5,
    /// Card at the entry slot
    Entering = 6,
}

/// Chip power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChipPowerState {
    /// Chip powered and ready
    Online = 0,
    /// Chip present but unpowered
    PoweredOff = 1,
    /// Chip busy
    Busy = 2,
    /// No chip module
    NoDevice = 3,
    /// Hardware error
    HwError = 4,
    /// No card
    NoCard = 5,
    /// Not supported
    NotSupp = 6,
    /// Unknown
    Unknown = 7,
}

/// `WFS_INF_IDC_STATUS` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdcStatus {
    /// Device state
    pub device: DeviceState,
    /// Media state
    pub media: MediaState,
    /// Chip power state
    pub chip_power: ChipPowerState,
    /// Retain bin is not supported
    pub retain_bin_supported: bool,
    /// Security module is not supported
    pub security_supported: bool,
    /// Cards retained so far
    pub cards: u16,
}

impl IdcStatus {
    /// Status of a device without a card connection
    pub const fn without_card(device: DeviceState) -> Self {
        Self {
            device,
            media: MediaState::NotPresent,
            chip_power: ChipPowerState::NoCard,
            retain_bin_supported: false,
            security_supported: false,
            cards: 0,
        }
    }

    /// Translate a card status into media and chip power states
    pub fn from_card(status: &CardStatus) -> Self {
        let state = status.state;
        let (media, chip_power) = if state.contains(CardState::SPECIFIC) {
            (MediaState::Present, ChipPowerState::Online)
        } else if state.contains(CardState::NEGOTIABLE) {
            (MediaState::Present, ChipPowerState::Unknown)
        } else if state.contains(CardState::SWALLOWED) {
            (MediaState::Entering, ChipPowerState::PoweredOff)
        } else if state.contains(CardState::PRESENT) {
            (MediaState::Present, ChipPowerState::PoweredOff)
        } else if state.contains(CardState::ABSENT) {
            (MediaState::NotPresent, ChipPowerState::NoCard)
        } else {
            (MediaState::Unknown, ChipPowerState::Unknown)
        };

        Self {
            media,
            chip_power,
            ..Self::without_card(DeviceState::Online)
        }
    }
}

/// `WFS_INF_IDC_CAPABILITIES` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdcCaps {
    /// Reader type (DIP)
    pub dip: bool,
    /// Compound device
    pub compound: bool,
    /// Readable tracks
    pub read_tracks: DataSources,
    /// Writable tracks
    pub write_tracks: DataSources,
    /// Supported chip protocols
    pub chip_protocols: ChipProtocols,
    /// Retain bin capacity
    pub cards: u16,
    /// Security module present
    pub security: bool,
    /// Eject supported
    pub eject: bool,
    /// Chip power actions supported
    pub chip_power: bool,
}

impl IdcCaps {
    /// Capabilities of a PC/SC reader
    pub const fn pcsc(can_eject: bool) -> Self {
        Self {
            dip: true,
            compound: false,
            read_tracks: DataSources::empty(),
            write_tracks: DataSources::empty(),
            chip_protocols: ChipProtocols::T0.union(ChipProtocols::T1),
            cards: 0,
            security: false,
            eject: can_eject,
            chip_power: true,
        }
    }
}

bitflags! {
    /// Chip protocols
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChipProtocols: u16 {
        /// T=0
        const T0 = 0x0001;
        /// T=1
        const T1 = 0x0002;
    }
}

impl ChipProtocols {
    /// Map the protocol negotiated with the card
    pub const fn from_protocol(protocol: Option<Protocol>) -> Self {
        match protocol {
            Some(Protocol::T0) => Self::T0,
            Some(Protocol::T1) => Self::T1,
            _ => Self::empty(),
        }
    }
}

/// Chip power actions of `WFS_CMD_IDC_CHIP_POWER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PowerAction {
    /// Cold reset
    Cold = 0x0002,
    /// Warm reset
    Warm = 0x0004,
    /// Power off
    Off = 0x0008,
}

impl PowerAction {
    /// Look up a raw action
    pub const fn from_u16(action: u16) -> Option<Self> {
        match action {
            0x0002 => Some(Self::Cold),
            0x0004 => Some(Self::Warm),
            0x0008 => Some(Self::Off),
            _ => None,
        }
    }

    /// Disposition applied to the card connection
    pub const fn disposition(self) -> Disposition {
        match self {
            Self::Cold => Disposition::Unpower,
            Self::Warm => Disposition::Reset,
            Self::Off => Disposition::Leave,
        }
    }
}

/// Chip I/O exchange of `WFS_CMD_IDC_CHIP_IO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIo {
    /// Protocol used for the exchange
    pub protocol: ChipProtocols,
    /// Command or response bytes
    pub data: Bytes,
}

/// Position reported with `WFS_SRVE_IDC_MEDIADETECTED`
pub const CARD_READ_POSITION: u16 = 4;
