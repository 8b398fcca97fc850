//! End-to-end bridge tests: a real listener, a real WebSocket client, and
//! test doubles standing in for the inference backend.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tryon_bridge::channel::{ChannelError, ChannelHandle, ChannelShared, InferenceChannel};
use tryon_bridge::config::GatewayConfig;
use tryon_bridge::metrics::BridgeMetrics;
use tryon_bridge::registry::{IdleSweeper, SessionRegistry};
use tryon_bridge::server::BridgeServer;
use tryon_bridge::session::SessionState;
use tryon_shared::protocol::{ErrorCode, ServerMessage};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backend double that echoes every frame back unmodified and counts its
/// open channels, so tests can verify nothing leaks.
struct EchoChannel {
    capacity: usize,
    open_handles: Arc<AtomicUsize>,
}

impl EchoChannel {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl InferenceChannel for EchoChannel {
    async fn open_channel(&self, session_id: &str) -> Result<Arc<ChannelHandle>, ChannelError> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.capacity);
        let shared = Arc::new(ChannelShared::default());

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        let counter = self.open_handles.clone();
        let pump_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shared.close_requested() => break,
                    maybe = outbound_rx.recv() => match maybe {
                        Some(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(Arc::new(ChannelHandle::new(
            session_id.to_string(),
            outbound_tx,
            inbound_rx,
            shared,
        )))
    }
}

/// Backend double whose channels can never be opened.
struct FailingChannel;

#[async_trait]
impl InferenceChannel for FailingChannel {
    async fn open_channel(&self, _session_id: &str) -> Result<Arc<ChannelHandle>, ChannelError> {
        Err(ChannelError::Unavailable("backend down".to_string()))
    }
}

/// Backend double that accepts one queued frame and never consumes it, so
/// every further frame hits backpressure.
struct StalledChannel;

#[async_trait]
impl InferenceChannel for StalledChannel {
    async fn open_channel(&self, session_id: &str) -> Result<Arc<ChannelHandle>, ChannelError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (_inbound_tx, inbound_rx) = mpsc::channel(1);
        let shared = Arc::new(ChannelShared::default());

        // Keep the consumer end alive without draining it.
        let pump_shared = shared.clone();
        tokio::spawn(async move {
            pump_shared.close_requested().await;
            drop(outbound_rx);
        });

        Ok(Arc::new(ChannelHandle::new(
            session_id.to_string(),
            outbound_tx,
            inbound_rx,
            shared,
        )))
    }
}

async fn start_server(
    channel: Arc<dyn InferenceChannel>,
) -> (SocketAddr, Arc<BridgeServer>, broadcast::Sender<()>) {
    let metrics = BridgeMetrics::new();
    let registry = Arc::new(SessionRegistry::new(metrics.clone()));
    let server = Arc::new(BridgeServer::new(
        GatewayConfig::default(),
        registry,
        channel,
        metrics,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(server.clone().serve(listener, shutdown_tx.subscribe()));

    (addr, server, shutdown_tx)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .expect("client should connect");
    ws
}

/// Next parseable server message, skipping transport-level frames.
async fn next_server_message(ws: &mut WsClient) -> ServerMessage {
    let deadline = Duration::from_secs(2);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("socket closed while waiting for server message")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("unparseable server message");
        }
    }
}

async fn establish(ws: &mut WsClient) -> String {
    match next_server_message(ws).await {
        ServerMessage::ConnectionEstablished(payload) => {
            assert!(!payload.session_id.is_empty());
            payload.session_id
        }
        other => panic!("Expected connection_established, got {:?}", other),
    }
}

fn video_frame_json(session_id: &str, timestamp: i64, payload: &[u8]) -> String {
    serde_json::json!({
        "type": "video_frame",
        "data": {
            "frameData": BASE64.encode(payload),
            "format": "jpeg",
            "timestamp": timestamp,
            "sessionId": session_id,
            "width": 640,
            "height": 480,
            "cameraFacing": "front",
            "quality": 80
        }
    })
    .to_string()
}

async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn echo_round_trip_delivers_the_processed_frame() {
    let (addr, _server, _shutdown) = start_server(Arc::new(EchoChannel::new(5))).await;
    let mut ws = connect(addr).await;
    let session_id = establish(&mut ws).await;

    ws.send(Message::Text(
        video_frame_json(&session_id, 1000, b"frame-bytes").into(),
    ))
    .await
    .unwrap();

    match next_server_message(&mut ws).await {
        ServerMessage::ProcessedFrame(frame) => {
            assert_eq!(frame.session_id, session_id);
            assert_eq!(frame.timestamp, 1000);
            assert_eq!(
                BASE64.decode(frame.frame_data.as_bytes()).unwrap(),
                b"frame-bytes"
            );
            assert_eq!(frame.format, "jpeg");
            assert_eq!(frame.metadata.get("width").map(String::as_str), Some("640"));
        }
        other => panic!("Expected processed_frame, got {:?}", other),
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (addr, _server, _shutdown) = start_server(Arc::new(EchoChannel::new(5))).await;
    let mut ws = connect(addr).await;
    establish(&mut ws).await;

    ws.send(Message::Text(
        r#"{"type":"ping","data":{"timestamp":424242}}"#.into(),
    ))
    .await
    .unwrap();

    match next_server_message(&mut ws).await {
        ServerMessage::Pong(pong) => assert_eq!(pong.timestamp, 424242),
        other => panic!("Expected pong, got {:?}", other),
    }
}

#[tokio::test]
async fn failing_backend_yields_channel_unavailable_and_a_clean_registry() {
    let (addr, server, _shutdown) = start_server(Arc::new(FailingChannel)).await;
    let mut ws = connect(addr).await;

    match next_server_message(&mut ws).await {
        ServerMessage::Error(payload) => {
            assert_eq!(payload.code, ErrorCode::ChannelUnavailable);
            assert!(!payload.message.is_empty());
        }
        other => panic!("Expected error, got {:?}", other),
    }

    // The server closes the socket after the error.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket should close after the error");

    let registry = server.registry().clone();
    assert!(
        wait_until(Duration::from_secs(2), move || registry.is_empty()).await,
        "registry should be empty after a failed connect"
    );
}

#[tokio::test]
async fn malformed_frames_are_skipped_and_the_session_continues() {
    let (addr, _server, _shutdown) = start_server(Arc::new(EchoChannel::new(5))).await;
    let mut ws = connect(addr).await;
    let session_id = establish(&mut ws).await;

    // Invalid base64; the frame is dropped, the session survives.
    ws.send(Message::Text(
        r#"{"type":"video_frame","data":{"frameData":"%%%","format":"jpeg","timestamp":1}}"#
            .into(),
    ))
    .await
    .unwrap();

    ws.send(Message::Text(
        video_frame_json(&session_id, 2000, b"still-alive").into(),
    ))
    .await
    .unwrap();

    match next_server_message(&mut ws).await {
        ServerMessage::ProcessedFrame(frame) => assert_eq!(frame.timestamp, 2000),
        other => panic!("Expected processed_frame, got {:?}", other),
    }
}

#[tokio::test]
async fn sessions_close_without_leaking_registry_entries_or_channels() {
    let echo = Arc::new(EchoChannel::new(5));
    let open_handles = echo.open_handles.clone();
    let (addr, server, _shutdown) = start_server(echo).await;

    for _ in 0..5 {
        let mut ws = connect(addr).await;
        let session_id = establish(&mut ws).await;
        ws.send(Message::Text(
            video_frame_json(&session_id, 1, b"payload").into(),
        ))
        .await
        .unwrap();
        let _ = next_server_message(&mut ws).await;
        ws.close(None).await.unwrap();
    }

    let registry = server.registry().clone();
    assert!(
        wait_until(Duration::from_secs(2), move || registry.is_empty()).await,
        "registry should return to its pre-test size"
    );
    assert!(
        wait_until(Duration::from_secs(2), move || {
            open_handles.load(Ordering::SeqCst) == 0
        })
        .await,
        "every backend channel should be released"
    );
}

#[tokio::test]
async fn processed_frames_keep_their_submission_order() {
    let (addr, _server, _shutdown) = start_server(Arc::new(EchoChannel::new(5))).await;
    let mut ws = connect(addr).await;
    let session_id = establish(&mut ws).await;

    for timestamp in [1i64, 2, 3] {
        ws.send(Message::Text(
            video_frame_json(&session_id, timestamp, &timestamp.to_be_bytes()).into(),
        ))
        .await
        .unwrap();
    }

    let mut observed = Vec::new();
    for _ in 0..3 {
        match next_server_message(&mut ws).await {
            ServerMessage::ProcessedFrame(frame) => observed.push(frame.timestamp),
            other => panic!("Expected processed_frame, got {:?}", other),
        }
    }
    assert_eq!(observed, vec![1, 2, 3]);
}

#[tokio::test]
async fn a_saturated_queue_drops_frames_while_the_session_stays_active() {
    let (addr, server, _shutdown) = start_server(Arc::new(StalledChannel)).await;
    let mut ws = connect(addr).await;
    let session_id = establish(&mut ws).await;

    let total = 5u64;
    for timestamp in 0..total {
        ws.send(Message::Text(
            video_frame_json(&session_id, timestamp as i64, b"payload").into(),
        ))
        .await
        .unwrap();
    }

    let registry = server.registry().clone();
    let sid = session_id.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            registry
                .get(&sid)
                .map(|session| {
                    let stats = session.stats();
                    stats.frames_sent + stats.dropped_frames == total
                })
                .unwrap_or(false)
        })
        .await,
        "all frames should be accounted for"
    );

    let session = server.registry().get(&session_id).expect("session still live");
    let stats = session.stats();
    // The stalled queue holds one frame; every later one is dropped, newest
    // first, and the session never leaves ACTIVE.
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.dropped_frames, total - 1);
    assert_eq!(stats.state, SessionState::Active);
}

#[tokio::test]
async fn idle_sessions_are_evicted_and_active_ones_are_not() {
    let (addr, server, _shutdown) = start_server(Arc::new(EchoChannel::new(5))).await;
    let _sweeper = IdleSweeper::new(server.registry().clone())
        .with_max_idle(Duration::from_millis(300))
        .with_interval(Duration::from_millis(50))
        .start();

    let mut ws = connect(addr).await;
    let session_id = establish(&mut ws).await;

    // Stay busy for a while: activity within the window must not be evicted.
    for _ in 0..3 {
        ws.send(Message::Text(
            video_frame_json(&session_id, 1, b"keepalive").into(),
        ))
        .await
        .unwrap();
        let _ = next_server_message(&mut ws).await;
        assert!(server.registry().get(&session_id).is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Then go idle and get swept.
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle session should be closed by the sweeper");

    let registry = server.registry().clone();
    assert!(
        wait_until(Duration::from_secs(2), move || registry.is_empty()).await,
        "evicted session should leave the registry"
    );
}
