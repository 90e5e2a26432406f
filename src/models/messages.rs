use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::AwarenessRecord;

/// Text frames sent by clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "awareness")]
    Awareness { state: AwarenessRecord },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Text frames sent by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "awareness-broadcast")]
    AwarenessBroadcast { users: Vec<AwarenessRecord> },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error(ErrorMessage),
    #[serde(rename = "reconnect")]
    Reconnect { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    CorruptDelta,
    InvalidMessage,
    CapacityExhausted,
    RoomClosed,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::CorruptDelta => write!(f, "corrupt-delta"),
            ErrorCode::InvalidMessage => write!(f, "invalid-message"),
            ErrorCode::CapacityExhausted => write!(f, "capacity-exhausted"),
            ErrorCode::RoomClosed => write!(f, "room-closed"),
            ErrorCode::Internal => write!(f, "internal"),
        }
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }

    /// JSON text of this frame. Serializing these plain types cannot fail.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","code":"internal","message":"encode"}"#.to_string())
    }
}
