//! Document/session store contract and the in-memory implementation.
//!
//! The real deployment backs this with a document database; the core only
//! relies on the small contract below. `MemoryStore` keeps the same ordering
//! semantics (timestamp order within a session, newest-first reads) so tests
//! exercise the same code paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::history::ChatTurn;
use crate::session::ChatSession;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store write rejected: {0}")]
    WriteRejected(String),
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Append one turn. Turns are immutable once inserted.
    async fn insert_turn(&self, turn: &ChatTurn) -> Result<(), StoreError>;

    /// Most recent turns for a session, newest first. Empty result is fine.
    async fn recent_turns(&self, session_id: &str, limit: usize)
        -> Result<Vec<ChatTurn>, StoreError>;

    async fn count_turns(&self, session_id: &str) -> Result<u64, StoreError>;

    /// Upsert by session id, last-write-wins on `last_interaction`.
    async fn upsert_session(&self, session: &ChatSession) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    turns: Mutex<Vec<ChatTurn>>,
    sessions: Mutex<HashMap<String, ChatSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic helper: full turn log across sessions, append order.
    pub fn all_turns(&self) -> Vec<ChatTurn> {
        self.turns.lock().expect("turn store poisoned").clone()
    }

    pub fn session_snapshot(&self, session_id: &str) -> Option<ChatSession> {
        self.sessions
            .lock()
            .expect("session store poisoned")
            .get(session_id)
            .cloned()
    }
}

#[async_trait]
impl TurnStore for MemoryStore {
    async fn insert_turn(&self, turn: &ChatTurn) -> Result<(), StoreError> {
        self.turns
            .lock()
            .expect("turn store poisoned")
            .push(turn.clone());
        Ok(())
    }

    async fn recent_turns(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let turns = self.turns.lock().expect("turn store poisoned");
        let mut recent: Vec<ChatTurn> = turns
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        // Append order equals timestamp order within a session; newest first.
        recent.reverse();
        recent.truncate(limit);
        Ok(recent)
    }

    async fn count_turns(&self, session_id: &str) -> Result<u64, StoreError> {
        let turns = self.turns.lock().expect("turn store poisoned");
        Ok(turns.iter().filter(|t| t.session_id == session_id).count() as u64)
    }

    async fn upsert_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        match sessions.get(&session.session_id) {
            Some(existing) if existing.last_interaction > session.last_interaction => {
                // Stale write; keep the newer record.
            }
            _ => {
                sessions.insert(session.session_id.clone(), session.clone());
            }
        }
        Ok(())
    }
}
