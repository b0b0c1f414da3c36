//! Per-session liveness: idle, updating, or error.
//!
//! Advisory state for sidebars and spinners. It lives only in memory, has no
//! expiry, and is not derived from the cached messages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{broadcast, RwLock};

use crate::event::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Updating,
    Idle,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Updating => "updating",
            SessionStatus::Idle => "idle",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

pub struct StatusProjection {
    inner: RwLock<HashMap<SessionId, SessionStatus>>,
    changes: broadcast::Sender<StatusChange>,
}

impl Default for StatusProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusProjection {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Store `status` for `session_id`. Returns false, and notifies nobody, when
    /// the stored status is already `status`.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> bool {
        {
            let mut g = self.inner.write().await;
            if g.get(session_id) == Some(&status) {
                return false;
            }
            g.insert(session_id.to_string(), status);
        }
        log::debug!("session {} is now {}", session_id, status);
        let _ = self.changes.send(StatusChange {
            session_id: session_id.to_string(),
            status,
        });
        true
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.read().await.get(session_id).copied()
    }

    pub async fn snapshot(&self) -> HashMap<SessionId, SessionStatus> {
        self.inner.read().await.clone()
    }
}
