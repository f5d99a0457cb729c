//! Per-customer conversation sessions and the process-wide registry.
//!
//! A session is the mutable record the routing state machine reads and
//! writes: who owns the conversation (bot or human), when it last moved,
//! and the counters that pace sentiment analysis. The registry is an
//! injected, concurrency-safe map — never a module-level singleton.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Who currently owns the conversation. Closed set; unknown values are
/// rejected at the serde boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Bot,
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub customer_id: String,
    pub current_agent: AgentType,
    pub start_time: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    /// Last full-analysis sentiment, mirrored here for staff dashboards.
    pub sentiment_score: f32,
    pub sentiment_confidence: f32,
    pub message_count: u32,
    /// Index of the last message that got a full sentiment pass; paces the
    /// periodic re-baseline in the analysis gate.
    pub last_analyzed_msg_index: u32,
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>, customer_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            customer_id: customer_id.into(),
            current_agent: AgentType::Bot,
            start_time: now,
            last_interaction: now,
            sentiment_score: 1.0,
            sentiment_confidence: 1.0,
            message_count: 0,
            last_analyzed_msg_index: 0,
        }
    }

    /// `last_interaction` is monotonically non-decreasing.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_interaction {
            self.last_interaction = now;
        }
    }
}

/// Handle to one session: the mutex is held for a whole `handle_query` turn,
/// which is what serializes concurrent calls for the same session id.
pub type SharedSession = Arc<Mutex<ChatSession>>;

/// Concurrency-safe session map. Write sections are short and never await.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent get-or-create: repeated calls with the same id return the
    /// same `Arc`; first writer wins under the map's write lock.
    pub fn get_or_create(&self, session_id: &str, customer_id: &str) -> SharedSession {
        if let Some(existing) = self.lookup(session_id) {
            return existing;
        }
        let mut map = self.inner.write().expect("session registry poisoned");
        map.entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, customer_id, "creating new session");
                Arc::new(Mutex::new(ChatSession::new(session_id, customer_id)))
            })
            .clone()
    }

    /// Explicit found/not-found; callers must handle both.
    pub fn lookup(&self, session_id: &str) -> Option<SharedSession> {
        self.inner
            .read()
            .expect("session registry poisoned")
            .get(session_id)
            .cloned()
    }

    /// Reuse the customer's unexpired session, else mint a fresh id. Expired
    /// sessions stay in the map as closed history; they are simply no longer
    /// matched here.
    pub async fn resolve_for_customer(&self, customer_id: &str, timeout_hours: i64) -> String {
        let candidates: Vec<SharedSession> = {
            let map = self.inner.read().expect("session registry poisoned");
            map.values().cloned().collect()
        };
        let cutoff = Utc::now() - Duration::hours(timeout_hours);
        for shared in candidates {
            let session = shared.lock().await;
            if session.customer_id == customer_id && session.last_interaction > cutoff {
                return session.session_id.clone();
            }
        }
        Uuid::new_v4().to_string()
    }

    pub fn remove(&self, session_id: &str) -> Option<SharedSession> {
        self.inner
            .write()
            .expect("session registry poisoned")
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown cleanup.
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("session registry poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let reg = SessionRegistry::new();
        let a = reg.get_or_create("s1", "cust-1");
        let b = reg.get_or_create("s1", "cust-1");
        assert!(Arc::ptr_eq(&a, &b), "same id must yield the same session");
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn lookup_distinguishes_not_found() {
        let reg = SessionRegistry::new();
        assert!(reg.lookup("missing").is_none());
        reg.get_or_create("s1", "cust-1");
        assert!(reg.lookup("s1").is_some());
    }

    #[tokio::test]
    async fn resolve_reuses_recent_session_and_expires_old_ones() {
        let reg = SessionRegistry::new();
        let shared = reg.get_or_create("s1", "cust-1");

        let resolved = reg.resolve_for_customer("cust-1", 24).await;
        assert_eq!(resolved, "s1");

        // Age the session past the timeout; the next resolve mints a new id.
        {
            let mut s = shared.lock().await;
            s.last_interaction = Utc::now() - Duration::hours(25);
        }
        let fresh = reg.resolve_for_customer("cust-1", 24).await;
        assert_ne!(fresh, "s1");
        // The old record is retained as closed history.
        assert!(reg.lookup("s1").is_some());
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let mut s = ChatSession::new("s1", "cust-1");
        let before = s.last_interaction;
        s.touch();
        assert!(s.last_interaction >= before);
    }
}
