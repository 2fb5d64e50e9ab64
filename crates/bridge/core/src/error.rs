//! Error types for the bridge

use std::fmt;

use crate::request::{RequestId, ServiceHandle};
use crate::xfs::ResultCode;

/// Resource manager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScardError {
    /// The blocking call was cancelled
    Cancelled,
    /// The timeout expired
    Timeout,
    /// Handle is invalid
    InvalidHandle,
    /// Resource manager is not running
    NoService,
    /// Reader is unavailable
    ReaderUnavailable,
    /// Card is used exclusively by someone else
    SharingViolation,
    /// Internal communication error
    CommError,
    /// No card in the reader
    NoSmartcard,
    /// Card was removed
    RemovedCard,
    /// Card was reset
    ResetCard,
    /// Reader name is unknown
    UnknownReader,
    /// No readers are attached
    NoReadersAvailable,
    /// Any other status code
    Other(u32),
}

impl ScardError {
    /// Translate into the result code reported to XFS clients
    pub const fn translate(self) -> ResultCode {
        match self {
            Self::InvalidHandle => ResultCode::InvalidHService,
            Self::ReaderUnavailable | Self::UnknownReader => ResultCode::ConnectionLost,
            Self::SharingViolation => ResultCode::Locked,
            Self::CommError => ResultCode::HardwareError,
            Self::Timeout => ResultCode::Timeout,
            Self::Cancelled => ResultCode::Canceled,
            Self::NoSmartcard | Self::RemovedCard => ResultCode::NoMedia,
            Self::NoService | Self::ResetCard | Self::NoReadersAvailable | Self::Other(_) => {
                ResultCode::InternalError
            }
        }
    }

    /// Whether the error invalidates an open card connection
    pub const fn drops_connection(self) -> bool {
        matches!(
            self,
            Self::RemovedCard
                | Self::ResetCard
                | Self::NoSmartcard
                | Self::ReaderUnavailable
                | Self::UnknownReader
                | Self::InvalidHandle
        )
    }
}

impl fmt::Display for ScardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "Wait was cancelled"),
            Self::Timeout => write!(f, "Timeout expired"),
            Self::InvalidHandle => write!(f, "Invalid handle"),
            Self::NoService => write!(f, "Resource manager is not running"),
            Self::ReaderUnavailable => write!(f, "Reader is unavailable"),
            Self::SharingViolation => write!(f, "Card is in use by another connection"),
            Self::CommError => write!(f, "Communication error"),
            Self::NoSmartcard => write!(f, "No card in reader"),
            Self::RemovedCard => write!(f, "Card was removed"),
            Self::ResetCard => write!(f, "Card was reset"),
            Self::UnknownReader => write!(f, "Unknown reader"),
            Self::NoReadersAvailable => write!(f, "No readers available"),
            Self::Other(code) => write!(f, "Resource manager error {:#010x}", code),
        }
    }
}

/// Request registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A request with the same key is already pending
    #[error("request {request} is already pending for service {service}")]
    Duplicate {
        /// Owning service
        service: ServiceHandle,
        /// Request id
        request: RequestId,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Configuration could not be read or deserialized
    #[error("invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Logical service is not configured
    #[error("logical service `{0}` is not configured")]
    UnknownLogicalService(String),
}

impl From<figment::Error> for SettingsError {
    fn from(error: figment::Error) -> Self {
        Self::Figment(Box::new(error))
    }
}

/// Errors surfaced by the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Resource manager failure
    #[error(transparent)]
    Scard(#[from] ScardError),

    /// Request registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Configuration failure
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Service handle does not name an open service
    #[error("invalid service handle {0}")]
    InvalidService(ServiceHandle),

    /// A service with this handle is already open
    #[error("service handle {0} is already open")]
    ServiceExists(ServiceHandle),

    /// Unlock without a lock
    #[error("service {0} is not locked")]
    NotLocked(ServiceHandle),

    /// Command data does not fit the command
    #[error("malformed data for command {0}")]
    InvalidCommandData(u32),

    /// The reader monitor thread could not be started
    #[error("failed to start reader monitor: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BridgeError {
    /// Result code reported to XFS clients
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Scard(e) => e.translate(),
            Self::Registry(RegistryError::Duplicate { .. }) => ResultCode::InvalidReqId,
            Self::Settings(_) => ResultCode::InternalError,
            Self::InvalidService(_) => ResultCode::InvalidHService,
            Self::ServiceExists(_) => ResultCode::InternalError,
            Self::NotLocked(_) => ResultCode::NotLocked,
            Self::InvalidCommandData(_) => ResultCode::InvalidData,
            Self::Spawn(_) => ResultCode::InternalError,
        }
    }
}
