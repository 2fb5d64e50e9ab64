//! Display utilities for the bridge CLI

use colored::Colorize;
use xfs_bridge_core::xfs::{Message, Payload, ResultCode};

/// Format a success message
pub(crate) fn success(message: &str) -> String {
    format!("{}", message.green().bold())
}

/// Format a warning message
pub(crate) fn warning(message: &str) -> String {
    format!("{}", message.yellow().bold())
}

/// Format a key-value section
pub(crate) fn key_value_box(title: &str, items: Vec<(&str, String)>) -> String {
    let mut result = format!("{}", title.bold().underline());

    for (key, value) in items {
        result.push_str(&format!("\n  {}: {}", key.bold(), value));
    }

    result
}

/// Format a result code, green on success
pub(crate) fn result_code(code: ResultCode) -> String {
    if code.is_success() {
        success(&code.to_string())
    } else {
        format!("{}", code.to_string().red().bold())
    }
}

/// One line describing a message
pub(crate) fn message_line(message: &Message) -> String {
    let payload = match &message.result.payload {
        Payload::None => String::new(),
        Payload::CardData(data) => data
            .iter()
            .map(|item| format!(" {:?}={:?}:{}", item.source, item.status, hex::encode(&item.data)))
            .collect(),
        Payload::ChipIo(io) => format!(" {}", hex::encode(&io.data)),
        Payload::ChipPower(atr) => format!(" atr={}", hex::encode(atr)),
        Payload::Status(status) => format!(" {:?}", status),
        Payload::Capabilities(caps) => format!(" {:?}", caps),
        Payload::DeviceStatus { reader, state } => format!(" {} {:?}", reader, state),
        Payload::MediaDetected(position) => format!(" position={}", position),
    };
    format!(
        "{:?} req={} code={} {}{}",
        message.kind,
        message.result.request_id,
        message.result.code,
        result_code(message.result_code()),
        payload
    )
}
