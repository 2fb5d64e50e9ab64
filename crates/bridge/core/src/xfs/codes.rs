//! Result codes reported to XFS clients

use std::fmt;

/// Completion and return codes of the XFS API, including the IDC class specific ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    /// Operation completed successfully
    Success = 0,
    /// Request was cancelled
    Canceled = -4,
    /// Device not ready or timed out
    DevNotReady = -13,
    /// Error on the device
    HardwareError = -14,
    /// Internal inconsistency in the service provider
    InternalError = -15,
    /// Information category not supported by the service class
    InvalidCategory = -19,
    /// Command not supported by the service class
    InvalidCommand = -20,
    /// Event class not supported by the service
    InvalidEventClass = -21,
    /// Service handle is not valid
    InvalidHService = -22,
    /// Window handle is not valid
    InvalidHwnd = -24,
    /// Request id does not correspond to an outstanding request
    InvalidReqId = -27,
    /// Service is locked under a different handle
    Locked = -32,
    /// Service is not locked
    NotLocked = -37,
    /// Provider cannot be unloaded now
    NotOkToUnload = -38,
    /// Window was not registered for any event class
    NotRegistered = -40,
    /// Timeout interval expired
    Timeout = -48,
    /// Category valid for the class but not supported by this provider
    UnsuppCategory = -49,
    /// Command valid for the class but not supported by this provider
    UnsuppCommand = -50,
    /// Input data is invalid
    InvalidData = -52,
    /// Connection to the device was lost
    ConnectionLost = -54,
    /// No card in the reader
    NoMedia = -201,
    /// Card present but unreadable
    InvalidMedia = -205,
    /// Requested chip protocol is not supported
    ProtocolNotSupp = -211,
    /// The card did not answer to reset
    AtrNotObtained = -212,
}

impl ResultCode {
    /// Raw `HRESULT` value
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether this code signals success
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "WFS_SUCCESS",
            Self::Canceled => "WFS_ERR_CANCELED",
            Self::DevNotReady => "WFS_ERR_DEV_NOT_READY",
            Self::HardwareError => "WFS_ERR_HARDWARE_ERROR",
            Self::InternalError => "WFS_ERR_INTERNAL_ERROR",
            Self::InvalidCategory => "WFS_ERR_INVALID_CATEGORY",
            Self::InvalidCommand => "WFS_ERR_INVALID_COMMAND",
            Self::InvalidEventClass => "WFS_ERR_INVALID_EVENT_CLASS",
            Self::InvalidHService => "WFS_ERR_INVALID_HSERVICE",
            Self::InvalidHwnd => "WFS_ERR_INVALID_HWND",
            Self::InvalidReqId => "WFS_ERR_INVALID_REQ_ID",
            Self::Locked => "WFS_ERR_LOCKED",
            Self::NotLocked => "WFS_ERR_NOT_LOCKED",
            Self::NotOkToUnload => "WFS_ERR_NOT_OK_TO_UNLOAD",
            Self::NotRegistered => "WFS_ERR_NOT_REGISTERED",
            Self::Timeout => "WFS_ERR_TIMEOUT",
            Self::UnsuppCategory => "WFS_ERR_UNSUPP_CATEGORY",
            Self::UnsuppCommand => "WFS_ERR_UNSUPP_COMMAND",
            Self::InvalidData => "WFS_ERR_INVALID_DATA",
            Self::ConnectionLost => "WFS_ERR_CONNECTION_LOST",
            Self::NoMedia => "WFS_ERR_IDC_NOMEDIA",
            Self::InvalidMedia => "WFS_ERR_IDC_INVALIDMEDIA",
            Self::ProtocolNotSupp => "WFS_ERR_IDC_PROTOCOLNOTSUPP",
            Self::AtrNotObtained => "WFS_ERR_IDC_ATRNOTOBTAINED",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values() {
        assert_eq!(ResultCode::Success.as_i32(), 0);
        assert_eq!(ResultCode::Canceled.as_i32(), -4);
        assert_eq!(ResultCode::Timeout.as_i32(), -48);
        assert_eq!(ResultCode::NoMedia.as_i32(), -201);
    }

    #[test]
    fn test_display_includes_name_and_value() {
        assert_eq!(
            ResultCode::InvalidHService.to_string(),
            "WFS_ERR_INVALID_HSERVICE (-22)"
        );
    }
}
