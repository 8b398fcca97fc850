//! Message envelopes for the client ↔ bridge WebSocket link
//!
//! Wire layout is `{"type": "<tag>", "data": {...}}` with camelCase field
//! names inside `data`, matching what the mobile client produces. Payload
//! bytes travel base64-encoded in `frameData`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Messages the client sends to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One captured camera frame for processing.
    VideoFrame(VideoFramePayload),
    /// Application-level latency probe; answered with [`ServerMessage::Pong`].
    Ping(PingPayload),
}

/// Messages the bridge sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection, carrying the assigned session id.
    ConnectionEstablished(ConnectionEstablishedPayload),
    /// One processed frame coming back from the inference backend.
    ProcessedFrame(ProcessedFramePayload),
    Pong(PongPayload),
    /// Terminal or frame-level error notification.
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFramePayload {
    /// Base64-encoded image bytes.
    pub frame_data: String,
    /// Codec tag, e.g. `jpeg`.
    pub format: String,
    /// Producer-assigned capture time, epoch milliseconds. Used for latency
    /// measurement, never for ordering.
    pub timestamp: i64,
    /// Clients echo the id issued in `connection_established`; the
    /// connection itself stays the source of truth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_facing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablishedPayload {
    pub session_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedFramePayload {
    pub session_id: String,
    /// Base64-encoded image bytes.
    pub frame_data: String,
    pub format: String,
    /// Capture time of the originating frame, echoed back by the backend.
    pub timestamp: i64,
    /// Open key-value map, passed through the pipeline opaquely.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: i64,
}

/// Machine-readable error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Bad client input; the frame is dropped and the session continues.
    MalformedFrame,
    /// Backend unreachable after retries; the session is terminated.
    ChannelUnavailable,
    /// A stale channel handle was used; treated like `ChannelUnavailable`.
    ChannelClosed,
    /// Defensive; session id collisions should be unreachable.
    DuplicateSession,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::MalformedFrame => write!(f, "MalformedFrame"),
            ErrorCode::ChannelUnavailable => write!(f, "ChannelUnavailable"),
            ErrorCode::ChannelClosed => write!(f, "ChannelClosed"),
            ErrorCode::DuplicateSession => write!(f, "DuplicateSession"),
            ErrorCode::Internal => write!(f, "Internal"),
        }
    }
}
