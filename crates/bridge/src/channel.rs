//! Inference Channel Client
//!
//! Maintains the connection to the inference backend and hands each session
//! its own half of a bidirectional frame stream. The [`InferenceChannel`]
//! trait is the seam the bridge server programs against; production uses
//! [`GrpcInferenceChannel`], tests substitute doubles.
//!
//! Failure semantics: transient stream errors trigger bounded reconnects
//! that preserve the session while dropping in-flight frames (retrying them
//! would trade latency for completeness this pipeline does not want).
//! Exhausting the retry budget marks the handle failed, which the bridge
//! surfaces to the client as `ChannelUnavailable`.

use crate::codec::Frame;
use crate::metrics::BridgeMetrics;
use crate::session::SessionId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};
use tryon_proto::inference_service_client::InferenceServiceClient;
use tryon_proto::{FrameChunk, ProcessedChunk};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),

    #[error("channel closed")]
    Closed,

    #[error("backpressure: frame queue full")]
    Backpressure,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Inference backend gRPC endpoint, e.g. `http://localhost:50052`.
    pub endpoint: String,
    /// Bound on frames queued toward the stream per session.
    pub frame_queue_capacity: usize,
    /// Stream (re)establishment attempts beyond the first.
    pub open_retries: u32,
    /// Initial backoff between attempts; doubles per retry.
    pub backoff: Duration,
    /// Stall detection on stream writes.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:50052".to_string(),
            frame_queue_capacity: 5,
            open_retries: 3,
            backoff: Duration::from_millis(200),
            send_timeout: Duration::from_millis(600),
        }
    }
}

/// Flags and signals shared between a [`ChannelHandle`] and the task
/// pumping its stream.
#[derive(Debug, Default)]
pub struct ChannelShared {
    closed: AtomicBool,
    failed: AtomicBool,
    close_signal: Notify,
}

impl ChannelShared {
    /// Idempotent; the first call wakes the pump so it releases backend
    /// resources promptly.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_one();
        }
    }

    /// Terminal failure: retries exhausted. Implies closed.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Completes once [`ChannelShared::close`] has been called.
    pub async fn close_requested(&self) {
        self.close_signal.notified().await;
    }
}

/// One session's half of the multiplexed inference stream.
///
/// The writer side is a bounded non-blocking queue; the reader side is a
/// lazy, ordered sequence of processed frames that ends when the channel
/// closes. The handle is shared between the bridge (writer) and the
/// session's receive loop (reader).
#[derive(Debug)]
pub struct ChannelHandle {
    session_id: SessionId,
    outbound: mpsc::Sender<Frame>,
    inbound: Mutex<Option<mpsc::Receiver<Frame>>>,
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    pub fn new(
        session_id: SessionId,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
        shared: Arc<ChannelShared>,
    ) -> Self {
        Self {
            session_id,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            shared,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Non-blocking enqueue toward the backend.
    ///
    /// Drop policy is drop-newest: when the queue is at capacity the frame
    /// being offered is the one rejected (`Backpressure`); queued frames
    /// are older and already accounted for. A stale handle yields `Closed`.
    pub fn try_send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ChannelError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// The ordered stream of processed frames for this session. Yields the
    /// receiver exactly once; it ends when the channel closes.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Frame>> {
        self.inbound.lock().unwrap().take()
    }

    /// Idempotent; releases backend resources. Safe to call multiple times.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether the channel terminated because the backend became
    /// unreachable (as opposed to an orderly close).
    pub fn is_failed(&self) -> bool {
        self.shared.is_failed()
    }
}

/// The seam between the bridge server and the inference backend.
#[async_trait]
pub trait InferenceChannel: Send + Sync {
    /// Establish (or attach to) the backend stream for one session.
    async fn open_channel(&self, session_id: &str) -> Result<Arc<ChannelHandle>, ChannelError>;
}

impl From<Frame> for FrameChunk {
    fn from(frame: Frame) -> Self {
        Self {
            session_id: frame.session_id,
            payload: frame.payload,
            format: frame.format,
            timestamp_ms: frame.timestamp_ms,
            metadata: frame.metadata,
        }
    }
}

impl From<ProcessedChunk> for Frame {
    fn from(chunk: ProcessedChunk) -> Self {
        Self {
            session_id: chunk.session_id,
            payload: chunk.payload,
            format: chunk.format,
            timestamp_ms: chunk.timestamp_ms,
            metadata: chunk.metadata,
        }
    }
}

/// tonic-backed channel client.
///
/// One lazily connected HTTP/2 channel with keep-alive is shared by every
/// session; each `open_channel` starts its own `StreamFrames` call on it,
/// so streams multiplex over a single connection and the session id in
/// each message does the correlation.
pub struct GrpcInferenceChannel {
    config: ChannelConfig,
    transport: Channel,
    metrics: BridgeMetrics,
}

impl GrpcInferenceChannel {
    pub fn new(config: ChannelConfig, metrics: BridgeMetrics) -> Result<Self, ChannelError> {
        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| ChannelError::Unavailable(format!("invalid endpoint: {}", e)))?
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));

        Ok(Self {
            transport: endpoint.connect_lazy(),
            config,
            metrics,
        })
    }
}

#[async_trait]
impl InferenceChannel for GrpcInferenceChannel {
    async fn open_channel(&self, session_id: &str) -> Result<Arc<ChannelHandle>, ChannelError> {
        let (grpc_tx, responses) = open_stream(&self.transport, &self.config).await?;
        info!(session_id = %session_id, "Inference stream established");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.frame_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.frame_queue_capacity);
        let shared = Arc::new(ChannelShared::default());

        tokio::spawn(pump_stream(
            session_id.to_string(),
            self.config.clone(),
            self.transport.clone(),
            outbound_rx,
            inbound_tx,
            grpc_tx,
            responses,
            shared.clone(),
            self.metrics.clone(),
        ));

        Ok(Arc::new(ChannelHandle::new(
            session_id.to_string(),
            outbound_tx,
            inbound_rx,
            shared,
        )))
    }
}

/// Start one `StreamFrames` call, retrying with exponential backoff before
/// giving up with `Unavailable`.
async fn open_stream(
    transport: &Channel,
    config: &ChannelConfig,
) -> Result<(mpsc::Sender<FrameChunk>, tonic::Streaming<ProcessedChunk>), ChannelError> {
    let mut attempt = 0u32;
    let mut backoff = config.backoff;

    loop {
        let (tx, rx) = mpsc::channel::<FrameChunk>(config.frame_queue_capacity);
        let mut client = InferenceServiceClient::new(transport.clone());

        match client.stream_frames(ReceiverStream::new(rx)).await {
            Ok(response) => return Ok((tx, response.into_inner())),
            Err(status) => {
                attempt += 1;
                if attempt > config.open_retries {
                    return Err(ChannelError::Unavailable(status.to_string()));
                }
                warn!(
                    attempt,
                    error = %status,
                    "Failed to open inference stream, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, Duration::from_secs(2));
            }
        }
    }
}

/// Per-session pump between the handle's queues and the gRPC stream.
///
/// Runs until the handle closes, every handle clone is dropped, or the
/// stream dies with no reconnect left. Frames in flight across a reconnect
/// are dropped, not retried.
#[allow(clippy::too_many_arguments)]
async fn pump_stream(
    session_id: SessionId,
    config: ChannelConfig,
    transport: Channel,
    mut outbound_rx: mpsc::Receiver<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
    mut grpc_tx: mpsc::Sender<FrameChunk>,
    mut responses: tonic::Streaming<ProcessedChunk>,
    shared: Arc<ChannelShared>,
    metrics: BridgeMetrics,
) {
    loop {
        let interruption: String = loop {
            tokio::select! {
                _ = shared.close_requested() => {
                    debug!(session_id = %session_id, "Inference channel closed");
                    return;
                }
                maybe = outbound_rx.recv() => match maybe {
                    Some(frame) => {
                        let chunk = FrameChunk::from(frame);
                        match tokio::time::timeout(config.send_timeout, grpc_tx.send(chunk)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break "stream write side closed".to_string(),
                            Err(_) => break format!(
                                "stream write stalled beyond {:?}",
                                config.send_timeout
                            ),
                        }
                    }
                    None => {
                        // Every handle clone is gone; nothing left to pump.
                        shared.close();
                        return;
                    }
                },
                message = responses.message() => match message {
                    Ok(Some(chunk)) => {
                        if inbound_tx.send(Frame::from(chunk)).await.is_err() {
                            shared.close();
                            return;
                        }
                    }
                    Ok(None) => break "backend closed the stream".to_string(),
                    Err(status) => break format!("stream error: {}", status),
                },
            }
        };

        if shared.is_closed() {
            return;
        }

        warn!(
            session_id = %session_id,
            reason = %interruption,
            "Inference stream interrupted, reconnecting"
        );
        metrics.record_channel_reconnect();
        tokio::time::sleep(config.backoff).await;

        match open_stream(&transport, &config).await {
            Ok((tx, rx)) => {
                grpc_tx = tx;
                responses = rx;
                info!(session_id = %session_id, "Inference stream re-established");
            }
            Err(e) => {
                error!(
                    session_id = %session_id,
                    error = %e,
                    "Inference channel lost after exhausting retries"
                );
                metrics.record_channel_failure();
                shared.mark_failed();
                // Dropping inbound_tx ends the session's receive loop, which
                // surfaces ChannelUnavailable to the client.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_frame(session_id: &str) -> Frame {
        Frame {
            session_id: session_id.to_string(),
            payload: vec![1, 2, 3],
            format: "jpeg".to_string(),
            timestamp_ms: 1000,
            metadata: HashMap::new(),
        }
    }

    /// Returns the handle plus the queue's consumer end; tests keep the
    /// consumer alive (without draining) so a full queue reads as full
    /// rather than closed.
    fn handle_with_capacity(capacity: usize) -> (ChannelHandle, mpsc::Receiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (_inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let handle = ChannelHandle::new(
            "sess-1".to_string(),
            outbound_tx,
            inbound_rx,
            Arc::new(ChannelShared::default()),
        );
        (handle, outbound_rx)
    }

    #[tokio::test]
    async fn try_send_rejects_the_newest_frame_when_full() {
        let (handle, _queue) = handle_with_capacity(2);

        assert!(handle.try_send(test_frame("sess-1")).is_ok());
        assert!(handle.try_send(test_frame("sess-1")).is_ok());
        assert_eq!(
            handle.try_send(test_frame("sess-1")),
            Err(ChannelError::Backpressure)
        );
    }

    #[tokio::test]
    async fn try_send_on_a_closed_handle_fails() {
        let (handle, _queue) = handle_with_capacity(2);
        handle.close();
        assert_eq!(
            handle.try_send(test_frame("sess-1")),
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (handle, _queue) = handle_with_capacity(1);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(!handle.is_failed());
    }

    #[tokio::test]
    async fn receiver_is_yielded_exactly_once() {
        let (handle, _queue) = handle_with_capacity(1);
        assert!(handle.take_receiver().is_some());
        assert!(handle.take_receiver().is_none());
    }

    #[test]
    fn frame_chunk_round_trip_preserves_fields() {
        let mut frame = test_frame("sess-1");
        frame.metadata.insert("width".to_string(), "640".to_string());

        let chunk = FrameChunk::from(frame.clone());
        let back = Frame::from(ProcessedChunk {
            session_id: chunk.session_id,
            payload: chunk.payload,
            format: chunk.format,
            timestamp_ms: chunk.timestamp_ms,
            metadata: chunk.metadata,
        });

        assert_eq!(back, frame);
    }
}
