//! Core of the real-time try-on session bridge.
//!
//! The bridge terminates client WebSocket connections carrying JSON+base64
//! video frames and pumps them over a gRPC bidirectional stream to the
//! inference backend, one session per client:
//!
//! - [`codec`] — pure transformation between wire payloads and [`codec::Frame`]
//! - [`channel`] — per-session streaming client to the inference backend
//! - [`session`] / [`registry`] — lifecycle state and the shared session map
//! - [`server`] — the WebSocket-facing pump
//! - [`metrics`] / [`http`] — observability off the hot path

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
