//! Relay wire protocol: one JSON object per WebSocket text frame.
//!
//! Every frame carries `type`, `id` and `timestamp`. Inbound frames are
//! parsed into [`ClientMessage`]; outbound frames are built from
//! [`ServerMessage`] and wrapped in a [`Frame`] that stamps id and time.

use portal_common::{new_message_id, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::LinkedDevice;

/// Messages clients send to the relay.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RegisterDesktop {
        device_name: String,
        #[serde(default)]
        pairing_code: String,
        pairing_passphrase: String,
        /// Previously assigned controller id, to keep the same session.
        #[serde(default)]
        device_id: Option<String>,
        /// Secret returned with that id; required to reclaim it.
        #[serde(default)]
        device_secret: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RegisterMobile {
        device_name: String,
        pairing_passphrase: String,
    },

    #[serde(rename_all = "camelCase")]
    ResumeSession {
        session_token: String,
        #[serde(default)]
        device_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Unpair {
        session_token: String,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Command {
        id: String,
        session_token: String,
        command: String,
        #[serde(default)]
        params: Value,
    },

    #[serde(rename_all = "camelCase")]
    CommandResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },

    #[serde(rename_all = "camelCase")]
    TerminalInput {
        session_token: String,
        terminal_id: String,
        data: String,
    },

    #[serde(rename_all = "camelCase")]
    TerminalOutput { terminal_id: String, data: String },

    /// Payload is relayed verbatim; see [`Inbound::raw`].
    StatusUpdate,

    Ping {
        #[serde(default)]
        id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Error codes surfaced in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPassphrase,
    DesktopNotFound,
    SessionNotFound,
    DesktopOffline,
    UnknownMessage,
    InvalidMessage,
    InvalidToken,
    PersistenceFailed,
}

/// Connection state pushed to subscribers when their controller drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RegisterDesktopResponse {
        success: bool,
        device_id: String,
        /// Sent only to the owning desktop.
        device_secret: String,
    },

    #[serde(rename_all = "camelCase")]
    PairResponse {
        success: bool,
        session_token: String,
        desktop_device_id: String,
        desktop_device_name: String,
        mobile_device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Command {
        command: String,
        params: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        requester_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CommandResponse {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },

    #[serde(rename_all = "camelCase")]
    TerminalInput { terminal_id: String, data: String },

    #[serde(rename_all = "camelCase")]
    TerminalOutput { terminal_id: String, data: String },

    /// Synthetic status the relay itself emits. Controller-origin status
    /// updates bypass this type and go out verbatim.
    #[serde(rename_all = "camelCase")]
    StatusUpdate { connection_status: ConnectionStatus },

    #[serde(rename_all = "camelCase")]
    RequestStatus { session_token: String },

    DeviceList { devices: Vec<LinkedDevice> },

    Error { code: ErrorCode, message: String },

    Pong,
}

/// An outbound message stamped with `id` and `timestamp`.
#[derive(Debug, Serialize)]
pub struct Frame<'a> {
    pub id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub message: &'a ServerMessage,
}

impl<'a> Frame<'a> {
    /// Wrap with a fresh message id.
    pub fn new(message: &'a ServerMessage) -> Self {
        Self::with_id(new_message_id(), message)
    }

    /// Wrap keeping a caller-chosen id (command correlation, ping echo).
    pub fn with_id(id: String, message: &'a ServerMessage) -> Self {
        Self {
            id,
            timestamp: now_millis(),
            message,
        }
    }

    pub fn to_json(&self) -> String {
        // ServerMessage holds only strings, bools, numbers and JSON values.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize frame");
            String::from("{}")
        })
    }
}

/// Serialize a message with a fresh id and timestamp.
pub fn encode(message: &ServerMessage) -> String {
    Frame::new(message).to_json()
}

/// A successfully parsed inbound frame.
#[derive(Debug)]
pub struct Inbound {
    pub message: ClientMessage,
    /// The `type` string as sent.
    pub kind: String,
    /// The whole frame, for messages relayed verbatim.
    pub raw: Value,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub code: ErrorCode,
    pub message: String,
}

impl FrameError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidMessage,
            message: message.into(),
        }
    }
}

/// Parse one text frame.
///
/// Non-JSON, non-object, or a missing `type` is `INVALID_MESSAGE`; an
/// unrecognized `type` is `UNKNOWN_MESSAGE`; a known type with missing or
/// ill-typed fields is `INVALID_MESSAGE`.
pub fn parse_frame(text: &str) -> Result<Inbound, FrameError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|_| FrameError::invalid("Failed to parse message"))?;

    let kind = match raw.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(FrameError::invalid("Missing message type")),
    };

    let message = ClientMessage::deserialize(&raw)
        .map_err(|e| FrameError::invalid(format!("Invalid {kind} message: {e}")))?;

    if matches!(message, ClientMessage::Unknown) {
        return Err(FrameError {
            code: ErrorCode::UnknownMessage,
            message: format!("Unknown message type: {kind}"),
        });
    }

    Ok(Inbound { message, kind, raw })
}
