//! Registry of live sessions
//!
//! Owned by whatever component opens connections. Sessions are added once
//! their handshake succeeded and removed when they stop.

use crate::{Result, Session};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared table of active sessions keyed by session id
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session, returning its id
    pub async fn insert(&self, session: Session) -> Uuid {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session);
        debug!("Registered session {} ({} active)", id, sessions.len());
        id
    }

    /// Stop tracking a session
    pub async fn remove(&self, id: &Uuid) -> Option<Session> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!("Unregistered session {}", id);
        }
        removed
    }

    /// Look up a session
    pub async fn get(&self, id: &Uuid) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Number of tracked sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is tracked
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Ids of every tracked session
    pub async fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Close and forget every tracked session
    ///
    /// Failures are logged; the first one is returned after every session
    /// was given the chance to close.
    pub async fn close_all(&self) -> Result<()> {
        let sessions: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!("Closing {} sessions", sessions.len());

        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Error closing session {}: {}", session.id(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
