//! CEN/XFS client side model: result codes, messages and the IDC service class

mod codes;
pub mod idc;
mod message;

pub use codes::ResultCode;
pub use message::{EventClass, Message, MessageType, Payload, WM_USER, WfsResult};
