use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use coderelay_error::BridgeError;
use coderelay_protocol::ServerMessage;

/// Durable snapshot of one session, handed to the store after state changes
/// that a restart must survive.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub cli_session_id: Option<String>,
    pub title: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub history: Vec<ServerMessage>,
}

/// Persistence seam for session history. The bridge appends every recorded
/// message and saves a snapshot on lifecycle changes; how those land on disk
/// (or don't) is up to the embedding server.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append(&self, session_id: &str, message: &ServerMessage) -> Result<(), BridgeError>;

    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), BridgeError>;

    async fn delete(&self, session_id: &str) -> Result<(), BridgeError>;
}

/// Store that keeps nothing. Used when the embedding server does its own
/// persistence or none at all.
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn append(&self, _session_id: &str, _message: &ServerMessage) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn save_snapshot(&self, _snapshot: &SessionSnapshot) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn delete(&self, _session_id: &str) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// In-memory store, mainly for tests and single-process setups.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryStoreState>,
}

#[derive(Default)]
struct MemoryStoreState {
    appended: HashMap<String, Vec<ServerMessage>>,
    snapshots: HashMap<String, SessionSnapshot>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appended(&self, session_id: &str) -> Vec<ServerMessage> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.appended.get(session_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshots.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn append(&self, session_id: &str, message: &ServerMessage) -> Result<(), BridgeError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state
            .appended
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), BridgeError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), BridgeError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.appended.remove(session_id);
        state.snapshots.remove(session_id);
        Ok(())
    }
}
