//! Messages posted to client windows

use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;

use super::codes::ResultCode;
use super::idc::{CardData, ChipIo, DeviceState, EventId, IdcCaps, IdcStatus};
use crate::request::{RequestId, ServiceHandle};

/// First message number available to applications
pub const WM_USER: u32 = 0x0400;

/// Window message numbers used for completions and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// `WFS_OPEN_COMPLETE`
    OpenComplete = WM_USER + 1,
    /// `WFS_CLOSE_COMPLETE`
    CloseComplete = WM_USER + 2,
    /// `WFS_LOCK_COMPLETE`
    LockComplete = WM_USER + 3,
    /// `WFS_UNLOCK_COMPLETE`
    UnlockComplete = WM_USER + 4,
    /// `WFS_REGISTER_COMPLETE`
    RegisterComplete = WM_USER + 5,
    /// `WFS_DEREGISTER_COMPLETE`
    DeregisterComplete = WM_USER + 6,
    /// `WFS_GETINFO_COMPLETE`
    GetInfoComplete = WM_USER + 7,
    /// `WFS_EXECUTE_COMPLETE`
    ExecuteComplete = WM_USER + 8,
    /// `WFS_EXECUTE_EVENT`
    ExecuteEvent = WM_USER + 20,
    /// `WFS_SERVICE_EVENT`
    ServiceEvent = WM_USER + 21,
    /// `WFS_USER_EVENT`
    UserEvent = WM_USER + 22,
    /// `WFS_SYSTEM_EVENT`
    SystemEvent = WM_USER + 23,
}

impl MessageType {
    /// Raw message number
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Event class of an event message, `None` for completions
    pub const fn event_class(self) -> Option<EventClass> {
        match self {
            Self::ExecuteEvent => Some(EventClass::EXECUTE),
            Self::ServiceEvent => Some(EventClass::SERVICE),
            Self::UserEvent => Some(EventClass::USER),
            Self::SystemEvent => Some(EventClass::SYSTEM),
            _ => None,
        }
    }
}

bitflags! {
    /// Event classes a window can register for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventClass: u32 {
        /// Service events
        const SERVICE = 1;
        /// User events
        const USER = 2;
        /// System events
        const SYSTEM = 4;
        /// Execute events
        const EXECUTE = 8;
    }
}

/// Operation specific data attached to a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No data
    None,
    /// Card data read by `WFS_CMD_IDC_READ_RAW_DATA`
    CardData(Vec<CardData>),
    /// Chip response of `WFS_CMD_IDC_CHIP_IO`
    ChipIo(ChipIo),
    /// ATR returned by `WFS_CMD_IDC_CHIP_POWER`
    ChipPower(Bytes),
    /// Device status
    Status(IdcStatus),
    /// Device capabilities
    Capabilities(IdcCaps),
    /// Device status change of the bound reader
    DeviceStatus {
        /// Physical reader name
        reader: String,
        /// New state
        state: DeviceState,
    },
    /// Position at which a card was detected
    MediaDetected(u16),
}

/// `WFSRESULT` equivalent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WfsResult {
    /// Request the result belongs to, zero for unsolicited events
    pub request_id: RequestId,
    /// Service that produced the result
    pub service: ServiceHandle,
    /// Completion code
    pub result: ResultCode,
    /// Time the result was produced
    pub timestamp: SystemTime,
    /// Command code, info category or event id
    pub code: u32,
    /// Attached data
    pub payload: Payload,
}

/// A message posted to a client window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message number
    pub kind: MessageType,
    /// Result carried by the message
    pub result: WfsResult,
}

impl Message {
    /// Completion of a request
    pub fn completion(
        kind: MessageType,
        service: ServiceHandle,
        request_id: RequestId,
        code: u32,
        result: ResultCode,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            result: WfsResult {
                request_id,
                service,
                result,
                timestamp: SystemTime::now(),
                code,
                payload,
            },
        }
    }

    /// Event message
    pub fn event(
        kind: MessageType,
        service: ServiceHandle,
        request_id: RequestId,
        event: EventId,
        payload: Payload,
    ) -> Self {
        Self::completion(
            kind,
            service,
            request_id,
            event as u32,
            ResultCode::Success,
            payload,
        )
    }

    /// Completion code carried by the message
    pub const fn result_code(&self) -> ResultCode {
        self.result.result
    }

    /// Whether this message is an event with the given id
    pub fn is_event(&self, event: EventId) -> bool {
        self.kind.event_class().is_some() && self.result.code == event as u32
    }
}
