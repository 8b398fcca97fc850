//! Bridge Error Taxonomy
//!
//! Frame-level errors are recovered locally (the frame is discarded and the
//! session continues); session-level errors terminate only the session they
//! belong to, never the process.

use crate::channel::ChannelError;
use crate::session::SessionState;
use tryon_shared::protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    #[error("invalid session state transition from {from} to {to}")]
    InvalidStateTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl BridgeError {
    /// The machine-readable code surfaced to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            BridgeError::DuplicateSession(_) => ErrorCode::DuplicateSession,
            BridgeError::Channel(ChannelError::Closed) => ErrorCode::ChannelClosed,
            BridgeError::Channel(_) => ErrorCode::ChannelUnavailable,
            _ => ErrorCode::Internal,
        }
    }
}
