//! Live sessions, by client id.

use std::sync::Arc;

use dashmap::DashMap;
use roomlink_core::ClientId;
use serde::Serialize;
use tracing::debug;

use crate::session::{Session, SessionState};

/// Point-in-time view of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Client id.
    pub id: String,
    /// Room, once assigned.
    pub room: Option<String>,
    /// Lifecycle state.
    pub state: SessionState,
}

/// Tracks every session between accept and close.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, Arc<Session>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session.
    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id().clone();
        let _ = self.sessions.insert(id.clone(), session);
        debug!(client_id = %id, total = self.sessions.len(), "session registered");
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            debug!(client_id = %id, total = self.sessions.len(), "session unregistered");
        }
        removed
    }

    /// Look a session up.
    pub fn get(&self, id: &ClientId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions currently in `state`.
    pub fn count_in(&self, state: SessionState) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == state)
            .count()
    }

    /// Sessions assigned to `room`.
    pub fn in_room(&self, room: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().room() == Some(room))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Summaries of every tracked session, ordered by id.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionSummary {
                    id: s.id().to_string(),
                    room: s.room().map(str::to_owned),
                    state: s.state(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
