//! Authoritative map of live sessions.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Instant, SystemTime},
};

use remote_ops_protocol::{Handshake, ServerMessage, close_code};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    dispatcher::PendingCommands,
    events::{BrokerEvent, BrokerEvents},
};

/// Frame queued for delivery on a session's socket.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized protocol message.
    Frame(String),
    /// Close the socket with a code and reason, then stop draining.
    Close { code: u16, reason: String },
}

/// Transport send error.
#[derive(Debug, Error)]
pub enum TransportSendError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport is closed")]
    Closed,
}

/// Cloneable handle to a connection's outbound queue.
///
/// Business logic never owns the socket; the connection task drains this
/// queue onto the wire and drops the receiver when the socket goes away.
#[derive(Debug, Clone)]
pub struct SessionTransport {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionTransport {
    /// Create a transport plus the receiving end its connection task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Stable identity of the underlying connection.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the connection task is still draining the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Serialize and queue a message.
    ///
    /// # Errors
    /// Returns an error if serialization fails or the connection is gone.
    pub fn send(&self, message: &ServerMessage) -> Result<(), TransportSendError> {
        let frame = serde_json::to_string(message)?;
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportSendError::Closed)
    }

    /// Queue a close with the given code; a no-op if the connection is gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }
}

/// Read-only snapshot of a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub machine_id: String,
    pub project_directory: String,
    pub protocol_version: String,
    pub connected_at: SystemTime,
    pub last_seen_at: Instant,
}

struct Session {
    info: SessionInfo,
    transport: SessionTransport,
}

/// Handshake rejection at registration time.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("handshake session id must not be empty")]
    EmptySessionId,
}

/// The authoritative map of live sessions, indexed by session id and by
/// user (one user may run several machines concurrently).
///
/// Registration and removal serialize on one mutex so a supersede can never
/// race a concurrent removal into an inconsistent index.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    pending: Arc<PendingCommands>,
    events: Arc<BrokerEvents>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, HashSet<String>>,
}

impl SessionRegistry {
    /// Create an empty registry sharing the broker's correlation table and
    /// event bus.
    #[must_use]
    pub fn new(pending: Arc<PendingCommands>, events: Arc<BrokerEvents>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pending,
            events,
        }
    }

    /// Install a session for an authenticated connection.
    ///
    /// A live session claiming the same id is superseded: its transport is
    /// closed, its outstanding commands rejected, and its state torn down
    /// before the new session becomes authoritative.
    ///
    /// # Errors
    /// Rejects a handshake with an empty session id.
    pub fn register(
        &self,
        handshake: &Handshake,
        user_id: &str,
        transport: SessionTransport,
    ) -> Result<SessionInfo, RegisterError> {
        if handshake.session_id.trim().is_empty() {
            return Err(RegisterError::EmptySessionId);
        }

        if let Some(old) = self.take_session(&handshake.session_id, None) {
            tracing::info!(
                session_id = %handshake.session_id,
                "Superseding existing session"
            );
            old.transport.close(
                close_code::SUPERSEDED,
                "session superseded by a new connection",
            );
            self.finish_removal(old, "replaced");
        }

        let info = SessionInfo {
            session_id: handshake.session_id.clone(),
            user_id: user_id.to_string(),
            machine_id: handshake.machine_id.clone(),
            project_directory: handshake.project_directory.clone(),
            protocol_version: handshake.version.clone(),
            connected_at: SystemTime::now(),
            last_seen_at: Instant::now(),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.insert(
                handshake.session_id.clone(),
                Session {
                    info: info.clone(),
                    transport,
                },
            );
            inner
                .by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(handshake.session_id.clone());
        }

        tracing::info!(
            session_id = %info.session_id,
            user_id = %info.user_id,
            machine_id = %info.machine_id,
            "Session registered"
        );
        self.events.publish(BrokerEvent::Connected {
            session: info.clone(),
        });
        Ok(info)
    }

    /// Remove a session and reject its outstanding commands.
    ///
    /// Removing a session that no longer exists is a no-op.
    pub fn remove(&self, session_id: &str, reason: &str) {
        if let Some(session) = self.take_session(session_id, None) {
            self.finish_removal(session, reason);
        }
    }

    /// Remove only if `transport_id` still owns the session.
    ///
    /// Connection teardown uses this so a superseded connection's cleanup
    /// cannot tear down its replacement.
    pub fn remove_if_current(&self, session_id: &str, transport_id: Uuid, reason: &str) {
        if let Some(session) = self.take_session(session_id, Some(transport_id)) {
            self.finish_removal(session, reason);
        }
    }

    /// Refresh a session's liveness timestamp.
    ///
    /// Called on any inbound traffic from the session.
    pub fn touch(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.info.last_seen_at = Instant::now();
        }
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(session_id).map(|s| s.info.clone())
    }

    /// Snapshot of every session belonging to `user_id`.
    #[must_use]
    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).map(|s| s.info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.values().map(|s| s.info.clone()).collect()
    }

    /// The outbound handle of a live session.
    #[must_use]
    pub fn transport(&self, session_id: &str) -> Option<SessionTransport> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(session_id).map(|s| s.transport.clone())
    }

    fn take_session(&self, session_id: &str, required_transport: Option<Uuid>) -> Option<Session> {
        let mut inner = self.inner.lock().unwrap();
        let owned = inner.sessions.get(session_id).is_some_and(|session| {
            required_transport.is_none_or(|id| session.transport.id() == id)
        });
        if !owned {
            return None;
        }
        let session = inner.sessions.remove(session_id)?;
        if let Some(ids) = inner.by_user.get_mut(&session.info.user_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                inner.by_user.remove(&session.info.user_id);
            }
        }
        Some(session)
    }

    fn finish_removal(&self, session: Session, reason: &str) {
        self.pending.reject_session(&session.info.session_id, reason);
        tracing::info!(
            session_id = %session.info.session_id,
            reason,
            "Session removed"
        );
        self.events.publish(BrokerEvent::Disconnected {
            session: session.info,
            reason: reason.to_string(),
        });
    }
}
