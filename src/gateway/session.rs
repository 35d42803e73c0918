//! Connection/session bookkeeping
//!
//! Gateway-owned records, independent of pool shard state: a session going
//! away must never leak pool capacity, so teardown flips a cancellation
//! flag that stops not-yet-acquired calls while in-flight renders complete
//! and release through their leases.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Session identifier
pub type SessionId = Uuid;

/// How the client is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Single-shot: submit, collect, close
    Batch,
    /// Long-lived WebSocket with incremental submissions
    Persistent,
}

impl ConnectionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Batch => "batch",
            ConnectionType::Persistent => "persistent",
        }
    }
}

/// One live connection
#[derive(Debug)]
pub struct SessionRecord {
    pub identity: String,
    pub connection_type: ConnectionType,
    pub opened_at: Instant,
    pub last_heartbeat: Instant,
    /// Calls submitted but not yet completed
    pub pending_calls: usize,
}

/// Registry of live connections
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection
    pub fn open(&self, identity: String, connection_type: ConnectionType) -> SessionId {
        let id = Uuid::new_v4();
        let now = Instant::now();
        self.sessions.insert(
            id,
            SessionRecord {
                identity,
                connection_type,
                opened_at: now,
                last_heartbeat: now,
                pending_calls: 0,
            },
        );
        id
    }

    /// Record a heartbeat (any inbound traffic counts)
    pub fn heartbeat(&self, id: SessionId) {
        if let Some(mut record) = self.sessions.get_mut(&id) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// Track newly submitted calls
    pub fn add_pending(&self, id: SessionId, count: usize) {
        if let Some(mut record) = self.sessions.get_mut(&id) {
            record.pending_calls += count;
        }
    }

    /// One call finished (result or failure)
    pub fn call_finished(&self, id: SessionId) {
        if let Some(mut record) = self.sessions.get_mut(&id) {
            record.pending_calls = record.pending_calls.saturating_sub(1);
        }
    }

    /// Remove a connection's record
    pub fn close(&self, id: SessionId) {
        if let Some((_, record)) = self.sessions.remove(&id) {
            debug!(
                session = %id,
                connection = record.connection_type.as_str(),
                pending = record.pending_calls,
                "session closed"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Flips a cancellation flag when dropped
///
/// Held by the connection's own task; dropping it — on explicit close,
/// heartbeat timeout, or the connection future being torn down — cancels
/// every call of the session that has not yet begun acquisition.
pub struct CancelOnDrop {
    tx: watch::Sender<bool>,
}

impl CancelOnDrop {
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}
