//! Bridge Manager - tracks every live interactive session

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Information about an active session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    /// `user@host:port`
    pub endpoint: String,
    pub client: Option<SocketAddr>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// Serializable view of [`SessionInfo`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub endpoint: String,
    pub client: Option<String>,
    pub uptime_secs: u64,
    pub idle_secs: u64,
}

impl From<&SessionInfo> for SessionSummary {
    fn from(info: &SessionInfo) -> Self {
        Self {
            session_id: info.session_id.clone(),
            endpoint: info.endpoint.clone(),
            client: info.client.map(|c| c.to_string()),
            uptime_secs: info.created_at.elapsed().as_secs(),
            idle_secs: info.last_activity.elapsed().as_secs(),
        }
    }
}

struct SessionHandle {
    info: SessionInfo,
    /// Cancelling asks the session to close itself
    close: CancellationToken,
}

/// Manages all active interactive sessions
pub struct BridgeManager {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session that reached `Active`
    pub fn register(&self, session_id: &str, endpoint: String, client: Option<SocketAddr>, close: CancellationToken) {
        let now = Instant::now();
        let handle = SessionHandle {
            info: SessionInfo {
                session_id: session_id.to_string(),
                endpoint: endpoint.clone(),
                client,
                created_at: now,
                last_activity: now,
            },
            close,
        };

        self.sessions.write().insert(session_id.to_string(), handle);
        info!("Session registered: session={}, endpoint={}", session_id, endpoint);
    }

    /// Remove a session that finished closing
    pub fn unregister(&self, session_id: &str) -> Option<SessionInfo> {
        let handle = self.sessions.write().remove(session_id)?;
        info!("Session unregistered: session={}", session_id);
        Some(handle.info)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).map(|h| h.info.clone())
    }

    /// Ask one session to close. Returns `false` if it is unknown.
    pub fn close(&self, session_id: &str) -> bool {
        match self.sessions.read().get(session_id) {
            Some(handle) => {
                handle.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Update last activity time for a session
    pub fn touch(&self, session_id: &str) {
        if let Some(handle) = self.sessions.write().get_mut(session_id) {
            handle.info.last_activity = Instant::now();
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|h| SessionSummary::from(&h.info))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close all sessions (process shutdown) and wait up to `grace` for them
    /// to release their leases.
    pub async fn close_all(&self, grace: Duration) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read();
            for handle in sessions.values() {
                handle.close.cancel();
            }
            sessions.keys().cloned().collect()
        };

        for session_id in &ids {
            info!("Closing session: {}", session_id);
        }

        let deadline = Instant::now() + grace;
        while self.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new()
    }
}
