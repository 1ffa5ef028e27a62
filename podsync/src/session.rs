//! Session registry: which connection is attached to which pod, as whom.
//!
//! One entry per live WebSocket session. Re-attaching to a different pod
//! replaces the entry under a single write-lock acquisition, so a session
//! is never observable in a half-switched state.

use crate::model::epoch_secs;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One attached session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub member_id: Uuid,
    pub pod_id: Uuid,
    pub attached_at: u64,
}

/// Server-wide session → (member, pod) map.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a session to a pod, replacing any previous attachment.
    ///
    /// Returns the pod the session was previously attached to, so the
    /// caller can release interest in it.
    pub async fn attach(&self, session_id: Uuid, member_id: Uuid, pod_id: Uuid) -> Option<Uuid> {
        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(
            session_id,
            SessionEntry {
                session_id,
                member_id,
                pod_id,
                attached_at: epoch_secs(),
            },
        );
        previous.map(|entry| entry.pod_id)
    }

    /// Remove a session (disconnect).
    pub async fn detach(&self, session_id: Uuid) -> Option<SessionEntry> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session_id)
    }

    pub async fn get(&self, session_id: Uuid) -> Option<SessionEntry> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned()
    }

    pub async fn sessions_for_pod(&self, pod_id: Uuid) -> Vec<SessionEntry> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|entry| entry.pod_id == pod_id)
            .cloned()
            .collect()
    }

    /// Drop every attachment to a pod (deletion cascade). Returns how many
    /// sessions were detached.
    pub async fn detach_pod(&self, pod_id: Uuid) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.pod_id != pod_id);
        before - sessions.len()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
