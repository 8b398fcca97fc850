//! Session Bridge Server
//!
//! Terminates client WebSocket connections and pumps frames in both
//! directions under a drop-based backpressure policy. Each connection gets
//! one task reading the socket plus one receive loop draining its inference
//! channel; the only state they share with other sessions is the registry.

use crate::channel::{ChannelError, ChannelHandle, InferenceChannel};
use crate::codec;
use crate::codec::Frame;
use crate::config::GatewayConfig;
use crate::metrics::BridgeMetrics;
use crate::registry::SessionRegistry;
use crate::session::Session;
use chrono::Utc;
use futures::stream::StreamExt;
use futures::SinkExt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tryon_shared::protocol::{
    ClientMessage, ConnectionEstablishedPayload, ErrorCode, ErrorPayload, PongPayload,
    ServerMessage,
};
use uuid::Uuid;

/// Bound on messages queued toward one client socket. Processed frames are
/// dropped (not buffered) beyond it; control messages are rare enough to
/// await space.
const WRITER_QUEUE_CAPACITY: usize = 64;

pub struct BridgeServer {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    channel: Arc<dyn InferenceChannel>,
    metrics: BridgeMetrics,
}

impl BridgeServer {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<SessionRegistry>,
        channel: Arc<dyn InferenceChannel>,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            config,
            registry,
            channel,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept loop; one task per connection. Runs until the shutdown
    /// channel fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "Session bridge listening"),
            Err(_) => info!("Session bridge listening"),
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Session bridge shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let started = Instant::now();
        let session_id = Uuid::new_v4().to_string();
        info!(session_id = %session_id, %peer, "Client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Writer task: single owner of the socket's write half.
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(WRITER_QUEUE_CAPACITY);
        let writer_session = session_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!(session_id = %writer_session, error = %e, "Socket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let session = Arc::new(Session::new(session_id.clone(), self.metrics.clone()));
        if let Err(e) = self.registry.create(session.clone()) {
            error!(session_id = %session_id, error = %e, "Failed to register session");
            send_error(&writer_tx, e.code(), &e.to_string()).await;
            let _ = session.abort();
            drop(writer_tx);
            let _ = writer_task.await;
            return;
        }

        // Open the session's inference channel under a bounded budget.
        let opened = match tokio::time::timeout(
            self.config.channel_open_timeout,
            self.channel.open_channel(&session_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Unavailable(format!(
                "no inference channel within {:?}",
                self.config.channel_open_timeout
            ))),
        };

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Could not open inference channel");
                send_error(&writer_tx, ErrorCode::ChannelUnavailable, &e.to_string()).await;
                self.registry.remove(&session_id);
                let _ = session.abort();
                drop(writer_tx);
                let _ = writer_task.await;
                return;
            }
        };

        let inbound = handle.take_receiver();
        if let Err(e) = session.activate(handle.clone()) {
            error!(session_id = %session_id, error = %e, "Failed to activate session");
            handle.close();
            self.registry.remove(&session_id);
            session.complete_close();
            drop(writer_tx);
            let _ = writer_task.await;
            return;
        }

        let established = ServerMessage::ConnectionEstablished(ConnectionEstablishedPayload {
            session_id: session_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        if send_message(&writer_tx, &established).await.is_err() {
            self.teardown(&session, &handle).await;
            drop(writer_tx);
            let _ = writer_task.await;
            return;
        }

        // Receive loop: ordered processed frames, backend → client.
        let receive_task = match inbound {
            Some(receiver) => tokio::spawn(pump_processed_frames(
                receiver,
                session.clone(),
                self.registry.clone(),
                handle.clone(),
                writer_tx.clone(),
            )),
            None => {
                // Defensive: a fresh handle always yields its receiver.
                error!(session_id = %session_id, "Channel handle had no receiver");
                self.teardown(&session, &handle).await;
                drop(writer_tx);
                let _ = writer_task.await;
                return;
            }
        };

        // Inbound loop: client → backend.
        loop {
            tokio::select! {
                _ = session.close_requested() => {
                    info!(session_id = %session_id, "Session close requested");
                    break;
                }
                maybe = ws_rx.next() => match maybe {
                    Some(Ok(Message::Text(text))) => {
                        let flow = self
                            .handle_client_text(&session, &handle, &writer_tx, &text)
                            .await;
                        if flow.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = writer_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(session_id = %session_id, "Client initiated close");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(session_id = %session_id, "Ignoring binary message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
        }

        self.teardown(&session, &handle).await;
        receive_task.abort();
        drop(writer_tx);
        let _ = writer_task.await;
        info!(
            session_id = %session_id,
            duration = ?started.elapsed(),
            "Client disconnected"
        );
    }

    /// Closing → release channel → deregister → Closed. Safe to run after
    /// the sweeper has already begun the close on its side.
    async fn teardown(&self, session: &Arc<Session>, handle: &Arc<ChannelHandle>) {
        if let Some(taken) = session.begin_close() {
            taken.close();
        }
        handle.close();
        self.registry.remove(session.id());
        session.complete_close();
    }

    /// One text frame from the client. `Break` means the session must end.
    async fn handle_client_text(
        &self,
        session: &Arc<Session>,
        handle: &Arc<ChannelHandle>,
        writer: &mpsc::Sender<Message>,
        text: &str,
    ) -> ControlFlow<()> {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Malformed client message");
                self.metrics.record_malformed_frame();
                return ControlFlow::Continue(());
            }
        };

        match message {
            ClientMessage::VideoFrame(payload) => {
                let frame = match codec::decode_frame(session.id(), &payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session_id = %session.id(), error = %e, "Dropping malformed frame");
                        self.metrics.record_malformed_frame();
                        return ControlFlow::Continue(());
                    }
                };

                self.registry.touch(session.id());
                match handle.try_send(frame) {
                    Ok(()) => session.record_frame_sent(),
                    Err(ChannelError::Backpressure) => {
                        // Queue at capacity: the incoming frame is the one
                        // dropped (drop-newest, applied consistently).
                        session.record_dropped_frame();
                        debug!(session_id = %session.id(), "Frame queue full, dropping frame");
                    }
                    Err(e) => {
                        error!(session_id = %session.id(), error = %e, "Inference channel lost");
                        send_error(
                            writer,
                            ErrorCode::ChannelUnavailable,
                            "inference backend unavailable",
                        )
                        .await;
                        return ControlFlow::Break(());
                    }
                }
            }
            ClientMessage::Ping(ping) => {
                let pong = ServerMessage::Pong(PongPayload {
                    timestamp: ping.timestamp,
                });
                let _ = send_message(writer, &pong).await;
            }
        }

        ControlFlow::Continue(())
    }
}

/// Per-session receive loop: drains the channel's ordered processed-frame
/// stream into the socket writer. Ends when the channel closes; if the
/// channel failed (rather than closed in an orderly way) the client is told
/// before the session is shut down.
async fn pump_processed_frames(
    mut inbound: mpsc::Receiver<Frame>,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    handle: Arc<ChannelHandle>,
    writer: mpsc::Sender<Message>,
) {
    while let Some(frame) = inbound.recv().await {
        registry.touch(session.id());
        let latency_ms = (Utc::now().timestamp_millis() - frame.timestamp_ms).max(0) as u64;
        session.record_frame_received(latency_ms);

        let message = ServerMessage::ProcessedFrame(codec::encode_frame(&frame));
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "Failed to encode processed frame");
                continue;
            }
        };

        match writer.try_send(Message::Text(json.into())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Client not draining: drop rather than buffer unboundedly.
                session.record_dropped_frame();
                debug!(session_id = %session.id(), "Socket queue full, dropping processed frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    if handle.is_failed() {
        warn!(session_id = %session.id(), "Inference channel failed, closing session");
        send_error(
            &writer,
            ErrorCode::ChannelUnavailable,
            "inference backend unavailable",
        )
        .await;
        session.request_close();
    }
}

async fn send_message(writer: &mpsc::Sender<Message>, message: &ServerMessage) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|e| {
        error!(error = %e, "Failed to serialize server message");
    })?;
    writer.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn send_error(writer: &mpsc::Sender<Message>, code: ErrorCode, message: &str) {
    let payload = ServerMessage::Error(ErrorPayload {
        code,
        message: message.to_string(),
        timestamp: Utc::now().timestamp_millis(),
    });
    if send_message(writer, &payload).await.is_err() {
        debug!(code = %code, "Error message not delivered; socket already gone");
    }
}
