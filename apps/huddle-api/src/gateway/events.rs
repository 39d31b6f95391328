//! Gateway opcodes, event types, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Identity;
use crate::chat::{ChatError, Gap, Message};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 3;
pub const OP_JOIN: u8 = 4;
pub const OP_LEAVE: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_PUBLISH: u8 = 8;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Room sequence, set on `MESSAGE_CREATE` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: Option<u64>, data: impl Serialize) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: seq,
            d: serde_json::to_value(data).unwrap_or_default(),
        }
    }

    /// A `MESSAGE_CREATE` dispatch carrying the message's sequence in `s`.
    pub fn message_create(message: &Message) -> Self {
        Self::dispatch(EventName::MESSAGE_CREATE, Some(message.sequence), message)
    }

    /// An `ERROR` dispatch for a failed operation. The session continues.
    pub fn error(err: &ChatError, nonce: Option<String>) -> Self {
        Self::dispatch(
            EventName::ERROR,
            None,
            ErrorData {
                code: err.code(),
                message: err.to_string(),
                nonce,
            },
        )
    }

    /// Build a RECONNECT message (op=7) telling the client to reconnect and
    /// resume.
    pub fn reconnect(reason: &str) -> Self {
        Self {
            op: OP_RECONNECT,
            t: None,
            s: None,
            d: serde_json::json!({ "reason": reason }),
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

/// Reconnect into `room_id` after the last sequence the client received.
#[derive(Debug, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub room_id: String,
    pub seq: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Deserialize)]
pub struct JoinPayload {
    pub room_id: String,
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PublishPayload {
    pub text: String,
    /// Echoed back in `MESSAGE_ACK` or `ERROR`.
    #[serde(default)]
    pub nonce: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatch payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReadyData<'a> {
    pub session_id: &'a str,
    pub user: &'a Identity,
    pub heartbeat_interval: u64,
}

#[derive(Debug, Serialize)]
pub struct RoomJoinedData<'a> {
    pub room_id: &'a str,
    pub messages: &'a [Message],
    pub gap: Option<Gap>,
    pub last_sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct RoomLeftData<'a> {
    pub room_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct MessageAckData {
    pub nonce: Option<String>,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct HistoryGapData<'a> {
    pub room_id: &'a str,
    pub requested_after: u64,
    pub resumes_at: u64,
}

#[derive(Debug, Serialize)]
pub struct ResumedData<'a> {
    pub session_id: &'a str,
    pub room_id: &'a str,
    pub replayed: usize,
    pub last_sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorData {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const ROOM_JOINED: &'static str = "ROOM_JOINED";
    pub const ROOM_LEFT: &'static str = "ROOM_LEFT";
    pub const MESSAGE_CREATE: &'static str = "MESSAGE_CREATE";
    pub const MESSAGE_ACK: &'static str = "MESSAGE_ACK";
    pub const HISTORY_GAP: &'static str = "HISTORY_GAP";
    pub const RESUMED: &'static str = "RESUMED";
    pub const ERROR: &'static str = "ERROR";
}
