//! Session Registry
//!
//! Single source of truth for active sessions. The map is the only
//! cross-session shared mutable state in the bridge: mutations
//! (`create`/`remove`/`touch`/`sweep_idle`) take the write lock and are
//! mutually exclusive, lookups share the read lock. The registry never
//! closes sockets or channels — ownership of those stays with the bridge
//! server, which always looks sessions up by id so an eviction is
//! immediately visible.

use crate::error::BridgeError;
use crate::metrics::BridgeMetrics;
use crate::session::{Session, SessionId, SessionStats};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    metrics: BridgeMetrics,
}

impl SessionRegistry {
    pub fn new(metrics: BridgeMetrics) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Insert a freshly created session. Id collisions should be
    /// unreachable given UUID generation but are checked defensively.
    pub fn create(&self, session: Arc<Session>) -> Result<(), BridgeError> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(session.id()) {
            warn!(session_id = %session.id(), "Rejecting duplicate session id");
            return Err(BridgeError::DuplicateSession(session.id().to_string()));
        }
        debug!(session_id = %session.id(), "Session registered");
        sessions.insert(session.id().to_string(), session);
        self.metrics.session_opened();
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Refresh a session's last-activity timestamp. Holds the write lock so
    /// a touch can never interleave with a sweep deciding to evict.
    pub fn touch(&self, session_id: &str) {
        let sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get(session_id) {
            session.touch();
        }
    }

    /// Delete and return the session for cleanup by the caller.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap();
        let removed = sessions.remove(session_id);
        if let Some(session) = &removed {
            debug!(session_id = %session_id, "Session deregistered");
            self.metrics.session_closed(session.uptime_seconds());
        }
        removed
    }

    /// Remove and return every session idle beyond `max_idle`. Sessions
    /// with recent traffic are untouched.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap();
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for() >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                let session = sessions.remove(id)?;
                self.metrics.session_closed(session.uptime_seconds());
                Some(session)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Snapshot of every session's stats, for the reporter.
    pub fn stats(&self) -> Vec<SessionStats> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|session| session.stats())
            .collect()
    }
}

/// Background eviction of idle sessions, off the request hot path.
///
/// The sweeper removes expired sessions from the registry, closes their
/// channel handles and fires their close signals; the connection task
/// owning each socket finishes the teardown.
pub struct IdleSweeper {
    registry: Arc<SessionRegistry>,
    max_idle: Duration,
    sweep_interval: Duration,
}

impl IdleSweeper {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            max_idle: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Start the sweep loop. Dropping the returned receiver stops it.
    pub fn start(self) -> mpsc::Receiver<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            info!(
                max_idle = ?self.max_idle,
                interval = ?self.sweep_interval,
                "IdleSweeper: starting sweep loop"
            );
            let mut interval = time::interval(self.sweep_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = self.registry.sweep_idle(self.max_idle);
                        for session in evicted {
                            info!(
                                session_id = %session.id(),
                                idle = ?session.idle_for(),
                                "Evicting idle session"
                            );
                            if let Some(handle) = session.begin_close() {
                                handle.close();
                            }
                            session.request_close();
                        }
                    }
                    _ = shutdown_tx.closed() => {
                        info!("IdleSweeper: sweep loop stopped");
                        break;
                    }
                }
            }
        });

        shutdown_rx
    }
}
