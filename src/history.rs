//! Per-session conversation log: turn model, durable append, prompt
//! formatting and the transfer briefing derived from turn metadata.
//!
//! Invariants: turns are append-only and timestamp-ordered within a session;
//! a turn is never mutated after insertion. The in-memory list mirrors the
//! durable store for this process's lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;
use crate::notify::{DynBroadcaster, TurnEvent};
use crate::store::TurnStore;

/// Author of a turn. Closed set; unknown wire values fail deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Bot,
    System,
    HumanAgent,
}

impl MessageRole {
    /// Label used in prompt transcripts ("Role: content" lines).
    pub fn label(&self) -> &'static str {
        match self {
            MessageRole::User => "User",
            MessageRole::Bot => "Bot",
            MessageRole::System => "System",
            MessageRole::HumanAgent => "Human agent",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub customer_id: String,
    pub session_id: String,
    /// Sentiment score/confidence, detected intent, retrieval evidence,
    /// transfer reason — whatever the producing step attaches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatTurn {
    pub fn new(
        role: MessageRole,
        content: &str,
        customer_id: String,
        session_id: String,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            customer_id,
            session_id,
            metadata,
        }
    }
}

/// Staff briefing assembled when a conversation is handed to a human.
#[derive(Debug, Clone, Serialize)]
pub struct TransferContext {
    pub recent_transcript: String,
    /// Sentiment scores pulled from turn metadata, oldest first.
    pub sentiment_trend: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_sentiment: Option<f32>,
}

/// One per active session; owned by the container's history registry.
pub struct ChatHistory {
    session_id: String,
    customer_id: String,
    store: Arc<dyn TurnStore>,
    broadcaster: DynBroadcaster,
    turns: Mutex<Vec<ChatTurn>>,
}

impl ChatHistory {
    pub fn new(
        session_id: String,
        customer_id: String,
        store: Arc<dyn TurnStore>,
        broadcaster: DynBroadcaster,
    ) -> Self {
        Self {
            session_id,
            customer_id,
            store,
            broadcaster,
            turns: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one turn: durable insert first, then the in-memory mirror,
    /// then a best-effort broadcast. Losing the broadcast never loses the
    /// stored turn; a failed store write fails the append.
    pub async fn add_turn(
        &self,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<ChatTurn, ChatError> {
        let turn = ChatTurn::new(
            role,
            content,
            self.customer_id.clone(),
            self.session_id.clone(),
            metadata,
        );
        self.store.insert_turn(&turn).await?;
        self.turns
            .lock()
            .expect("history mirror poisoned")
            .push(turn.clone());
        self.broadcaster.broadcast(TurnEvent {
            session_id: turn.session_id.clone(),
            role: turn.role,
            content: turn.content.clone(),
            timestamp: turn.timestamp,
        });
        Ok(turn)
    }

    /// Last `limit` turns as `Role: content` lines, oldest first. Pure
    /// function of the stored turns for a fixed limit.
    pub fn format_history_for_prompt(&self, limit: usize) -> String {
        let turns = self.turns.lock().expect("history mirror poisoned");
        let start = turns.len().saturating_sub(limit);
        turns[start..]
            .iter()
            .map(|t| format!("{}: {}", t.role.label(), t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Newest-first from durable storage. Tolerates an empty result.
    pub async fn get_recent_turns(&self, limit: usize) -> Result<Vec<ChatTurn>, ChatError> {
        Ok(self.store.recent_turns(&self.session_id, limit).await?)
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().expect("history mirror poisoned").len()
    }

    /// Briefing for the receiving human agent: bounded transcript plus the
    /// sentiment trend extracted from analyzed turns.
    pub async fn get_transfer_context(&self, limit: usize) -> Result<TransferContext, ChatError> {
        let mut recent = self.get_recent_turns(limit).await?;
        recent.reverse(); // oldest first for reading order

        let transcript = recent
            .iter()
            .map(|t| format!("{}: {}", t.role.label(), t.content))
            .collect::<Vec<_>>()
            .join("\n");

        let trend: Vec<f32> = recent
            .iter()
            .filter_map(|t| t.metadata.as_ref())
            .filter_map(|m| m.get("sentiment_score"))
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect();
        let average = if trend.is_empty() {
            None
        } else {
            Some(trend.iter().sum::<f32>() / trend.len() as f32)
        };

        Ok(TransferContext {
            recent_transcript: transcript,
            sentiment_trend: trend,
            average_sentiment: average,
        })
    }
}

/// Keyed history map, one authoritative `ChatHistory` per active session.
/// Injected from the composition root; write sections are short and never
/// await.
pub struct HistoryRegistry {
    store: Arc<dyn TurnStore>,
    broadcaster: DynBroadcaster,
    inner: RwLock<HashMap<String, Arc<ChatHistory>>>,
}

impl HistoryRegistry {
    pub fn new(store: Arc<dyn TurnStore>, broadcaster: DynBroadcaster) -> Self {
        Self {
            store,
            broadcaster,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: same session id, same `Arc`.
    pub fn get_or_create(&self, session_id: &str, customer_id: &str) -> Arc<ChatHistory> {
        if let Some(existing) = self
            .inner
            .read()
            .expect("history registry poisoned")
            .get(session_id)
        {
            return existing.clone();
        }
        let mut map = self.inner.write().expect("history registry poisoned");
        map.entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(ChatHistory::new(
                    session_id.to_string(),
                    customer_id.to_string(),
                    self.store.clone(),
                    self.broadcaster.clone(),
                ))
            })
            .clone()
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<ChatHistory>> {
        self.inner
            .read()
            .expect("history registry poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.inner
            .write()
            .expect("history registry poisoned")
            .remove(session_id);
    }

    /// Shutdown cleanup.
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("history registry poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopBroadcaster;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn mk_history(store: Arc<MemoryStore>) -> ChatHistory {
        ChatHistory::new(
            "s1".into(),
            "cust-1".into(),
            store,
            Arc::new(NoopBroadcaster),
        )
    }

    #[tokio::test]
    async fn add_turn_persists_and_mirrors() {
        let store = Arc::new(MemoryStore::new());
        let history = mk_history(store.clone());

        history
            .add_turn(MessageRole::User, "hello", None)
            .await
            .unwrap();
        history
            .add_turn(MessageRole::Bot, "hi there", None)
            .await
            .unwrap();

        assert_eq!(history.turn_count(), 2);
        assert_eq!(store.all_turns().len(), 2);

        let recent = history.get_recent_turns(10).await.unwrap();
        assert_eq!(recent[0].content, "hi there", "newest first");
    }

    #[tokio::test]
    async fn prompt_format_is_oldest_first_and_bounded() {
        let store = Arc::new(MemoryStore::new());
        let history = mk_history(store);

        for i in 0..5 {
            history
                .add_turn(MessageRole::User, &format!("msg {i}"), None)
                .await
                .unwrap();
        }
        let formatted = history.format_history_for_prompt(2);
        assert_eq!(formatted, "User: msg 3\nUser: msg 4");

        // Same inputs, same output.
        assert_eq!(formatted, history.format_history_for_prompt(2));
    }

    #[tokio::test]
    async fn transfer_context_extracts_sentiment_trend() {
        let store = Arc::new(MemoryStore::new());
        let history = mk_history(store);

        history
            .add_turn(
                MessageRole::User,
                "this is not working",
                Some(json!({ "sentiment_score": 0.2, "sentiment_confidence": 0.8 })),
            )
            .await
            .unwrap();
        history
            .add_turn(
                MessageRole::User,
                "still broken",
                Some(json!({ "sentiment_score": 0.3 })),
            )
            .await
            .unwrap();

        let ctx = history.get_transfer_context(10).await.unwrap();
        assert_eq!(ctx.sentiment_trend, vec![0.2, 0.3]);
        let avg = ctx.average_sentiment.unwrap();
        assert!((avg - 0.25).abs() < 1e-6);
        assert!(ctx.recent_transcript.contains("User: still broken"));
    }

    #[test]
    fn registry_returns_the_same_history_for_the_same_session() {
        let store: Arc<dyn crate::store::TurnStore> = Arc::new(MemoryStore::new());
        let reg = HistoryRegistry::new(store, Arc::new(NoopBroadcaster));
        let a = reg.get_or_create("s1", "cust-1");
        let b = reg.get_or_create("s1", "cust-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.lookup("other").is_none());
    }

    #[tokio::test]
    async fn empty_history_formats_to_empty_string() {
        let store = Arc::new(MemoryStore::new());
        let history = mk_history(store);
        assert_eq!(history.format_history_for_prompt(10), "");
        assert!(history.get_recent_turns(10).await.unwrap().is_empty());
    }
}
