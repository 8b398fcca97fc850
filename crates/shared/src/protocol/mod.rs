//! WebSocket Wire Protocol
//!
//! Shared message types for the client ↔ bridge link. Every envelope is
//! `{"type": ..., "data": ...}`; the `type` tag drives an exhaustively
//! matched enum rather than a string-keyed dispatch table, so an unhandled
//! message kind is a compile error, not a silent drop.

mod messages;

pub use messages::{
    ClientMessage, ConnectionEstablishedPayload, ErrorCode, ErrorPayload, PingPayload,
    PongPayload, ProcessedFramePayload, ServerMessage, VideoFramePayload,
};
