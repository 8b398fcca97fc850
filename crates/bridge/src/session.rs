//! Session Lifecycle and Per-Session Accounting
//!
//! A session correlates one client socket with one inference channel. Its
//! state machine is `Connecting → Active → Closing → Closed`, with
//! `Connecting → Closed` (channel open failure) and `Active → Closed`
//! (socket error) as the only shortcuts. The channel handle exists exactly
//! while the state is `Active` or `Closing`; state and handle live behind
//! one lock so that invariant cannot be observed half-updated.

use crate::channel::ChannelHandle;
use crate::error::BridgeError;
use crate::metrics::BridgeMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Closing => write!(f, "CLOSING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    handle: Option<Arc<ChannelHandle>>,
}

/// A point-in-time snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub dropped_frames: u64,
    pub fps: f64,
    pub last_latency_ms: u64,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    lifecycle: Mutex<Lifecycle>,
    created_at: DateTime<Utc>,
    started: Instant,
    last_activity: Mutex<Instant>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    dropped_frames: AtomicU64,
    last_latency_ms: AtomicU64,
    close_signal: Notify,
    metrics: BridgeMetrics,
}

impl Session {
    pub fn new(id: SessionId, metrics: BridgeMetrics) -> Self {
        let now = Instant::now();
        Self {
            id,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Connecting,
                handle: None,
            }),
            created_at: Utc::now(),
            started: now,
            last_activity: Mutex::new(now),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            close_signal: Notify::new(),
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().unwrap().state
    }

    /// Whether a channel handle is currently attached. Exists so tests can
    /// verify the handle-iff-active invariant.
    pub fn has_channel(&self) -> bool {
        self.lifecycle.lock().unwrap().handle.is_some()
    }

    /// `Connecting → Active`, attaching the session's channel handle.
    pub fn activate(&self, handle: Arc<ChannelHandle>) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state != SessionState::Connecting {
            return Err(BridgeError::InvalidStateTransition {
                from: lifecycle.state,
                to: SessionState::Active,
            });
        }
        lifecycle.state = SessionState::Active;
        lifecycle.handle = Some(handle);
        Ok(())
    }

    /// `Connecting → Closed`: the channel never opened, nothing to release.
    pub fn abort(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state != SessionState::Connecting {
            return Err(BridgeError::InvalidStateTransition {
                from: lifecycle.state,
                to: SessionState::Closed,
            });
        }
        lifecycle.state = SessionState::Closed;
        Ok(())
    }

    /// `Active → Closing`, detaching and returning the channel handle for
    /// the caller to close. Idempotent: a session already past `Active`
    /// yields `None`.
    pub fn begin_close(&self) -> Option<Arc<ChannelHandle>> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        match lifecycle.state {
            SessionState::Active => {
                lifecycle.state = SessionState::Closing;
                lifecycle.handle.take()
            }
            _ => None,
        }
    }

    /// `Closing → Closed`. By this point the socket and the channel handle
    /// must both have been released.
    pub fn complete_close(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.handle = None;
        lifecycle.state = SessionState::Closed;
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// A frame left for the inference backend.
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_frame_in();
    }

    /// A processed frame came back and was handed to the socket writer.
    pub fn record_frame_received(&self, latency_ms: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.metrics.record_frame_out(latency_ms as f64);
    }

    /// A frame was dropped under backpressure, in either direction.
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_frame_dropped();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Ask the connection task owning this session's socket to shut down.
    /// Used by the idle sweeper; never touches another session's resources.
    pub fn request_close(&self) {
        self.close_signal.notify_one();
    }

    /// Completes once [`Session::request_close`] has been called.
    pub async fn close_requested(&self) {
        self.close_signal.notified().await;
    }

    pub fn stats(&self) -> SessionStats {
        let uptime = self.uptime_seconds();
        let received = self.frames_received.load(Ordering::Relaxed);
        let fps = if uptime > 0.0 {
            received as f64 / uptime
        } else {
            0.0
        };

        SessionStats {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            uptime_seconds: uptime,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: received,
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            fps,
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelHandle, ChannelShared};
    use tokio::sync::mpsc;

    fn test_handle(session_id: &str) -> Arc<ChannelHandle> {
        let (outbound_tx, _outbound_rx) = mpsc::channel(5);
        let (_inbound_tx, inbound_rx) = mpsc::channel(5);
        Arc::new(ChannelHandle::new(
            session_id.to_string(),
            outbound_tx,
            inbound_rx,
            Arc::new(ChannelShared::default()),
        ))
    }

    fn test_session(id: &str) -> Session {
        Session::new(id.to_string(), BridgeMetrics::new())
    }

    #[test]
    fn lifecycle_follows_the_happy_path() {
        let session = test_session("sess-1");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.has_channel());

        session.activate(test_handle("sess-1")).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.has_channel());

        let handle = session.begin_close();
        assert!(handle.is_some());
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.has_channel());

        session.complete_close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.has_channel());
    }

    #[test]
    fn connecting_can_close_directly() {
        let session = test_session("sess-1");
        session.abort().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.has_channel());
    }

    #[test]
    fn activate_twice_is_rejected() {
        let session = test_session("sess-1");
        session.activate(test_handle("sess-1")).unwrap();
        let err = session.activate(test_handle("sess-1")).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStateTransition { .. }));
    }

    #[test]
    fn abort_after_activate_is_rejected() {
        let session = test_session("sess-1");
        session.activate(test_handle("sess-1")).unwrap();
        assert!(session.abort().is_err());
    }

    #[test]
    fn begin_close_is_idempotent() {
        let session = test_session("sess-1");
        session.activate(test_handle("sess-1")).unwrap();
        assert!(session.begin_close().is_some());
        assert!(session.begin_close().is_none());
        session.complete_close();
        assert!(session.begin_close().is_none());
    }

    #[test]
    fn counters_are_monotonic() {
        let session = test_session("sess-1");
        session.record_frame_sent();
        session.record_frame_sent();
        session.record_frame_received(25);
        session.record_dropped_frame();

        let stats = session.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(stats.last_latency_ms, 25);
    }

    #[tokio::test]
    async fn close_request_wakes_a_later_waiter() {
        let session = Arc::new(test_session("sess-1"));
        session.request_close();
        // The permit is stored, so a waiter arriving afterwards still wakes.
        tokio::time::timeout(Duration::from_millis(100), session.close_requested())
            .await
            .expect("close_requested should complete");
    }
}
