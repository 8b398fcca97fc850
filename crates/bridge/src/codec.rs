//! Frame Codec
//!
//! Pure, stateless transformation between the JSON+base64 wire payloads and
//! the internal [`Frame`] representation. No state, no side effects;
//! decoding fails with `MalformedFrame` on bad input, encoding never fails.

use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use tryon_shared::protocol::{ProcessedFramePayload, VideoFramePayload};

/// One unit of image data plus metadata, traveling in either direction.
///
/// Frames are transient: they exist for the duration of one round trip and
/// are dropped after the response is delivered (or the frame itself is
/// dropped under backpressure).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub session_id: String,
    /// Raw image bytes, already base64-decoded.
    pub payload: Vec<u8>,
    /// Codec tag, e.g. `jpeg`.
    pub format: String,
    /// Producer-assigned capture time, epoch milliseconds. Used for latency
    /// computation, not for ordering enforcement.
    pub timestamp_ms: i64,
    /// Open key-value map passed through the pipeline opaquely.
    pub metadata: HashMap<String, String>,
}

/// Decode an inbound `video_frame` payload into a [`Frame`].
///
/// The connection's session id is authoritative; a payload that claims a
/// different id is malformed. Well-known capture attributes are folded into
/// the opaque metadata map so the backend sees one uniform shape.
pub fn decode_frame(
    session_id: &str,
    payload: &VideoFramePayload,
) -> Result<Frame, BridgeError> {
    if let Some(claimed) = &payload.session_id {
        if claimed != session_id {
            return Err(BridgeError::MalformedFrame(format!(
                "frame session id {} does not match connection session {}",
                claimed, session_id
            )));
        }
    }

    if payload.format.is_empty() {
        return Err(BridgeError::MalformedFrame("empty frame format".to_string()));
    }

    let bytes = BASE64
        .decode(payload.frame_data.as_bytes())
        .map_err(|e| BridgeError::MalformedFrame(format!("invalid base64 payload: {}", e)))?;

    let mut metadata = HashMap::new();
    if let Some(width) = payload.width {
        metadata.insert("width".to_string(), width.to_string());
    }
    if let Some(height) = payload.height {
        metadata.insert("height".to_string(), height.to_string());
    }
    if let Some(facing) = &payload.camera_facing {
        metadata.insert("cameraFacing".to_string(), facing.clone());
    }
    if let Some(quality) = payload.quality {
        metadata.insert("quality".to_string(), quality.to_string());
    }

    Ok(Frame {
        session_id: session_id.to_string(),
        payload: bytes,
        format: payload.format.clone(),
        timestamp_ms: payload.timestamp,
        metadata,
    })
}

/// Encode a processed [`Frame`] into the outbound `processed_frame` payload.
pub fn encode_frame(frame: &Frame) -> ProcessedFramePayload {
    ProcessedFramePayload {
        session_id: frame.session_id.clone(),
        frame_data: BASE64.encode(&frame.payload),
        format: frame.format.clone(),
        timestamp: frame.timestamp_ms,
        metadata: frame.metadata.clone(),
    }
}
