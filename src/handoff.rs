//! Bot ↔ human transfer mechanics.
//!
//! Owns the two state transitions of the routing state machine and the
//! best-effort "customer explicitly asked for a human" detector. Transfers
//! persist a SYSTEM turn with the reason and a staff briefing before the
//! agent flag flips, so the audit log always explains the handoff.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::history::{HistoryRegistry, MessageRole};
use crate::llm::DynLlmClient;
use crate::session::{AgentType, ChatSession, SessionRegistry};

/// Why a conversation changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleReason {
    CustomerRequest,
    AgentInitiated,
    SentimentBased,
}

/// Reply shown while a human agent owns the conversation or is taking it
/// over. The orchestrator also uses it for the human-mode short circuit.
pub const FORWARDED_RESPONSE: &str =
    "Your message has been forwarded to our support team. A human agent will reply shortly.";

/// Outcome of the per-message transfer evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDecision {
    pub should_transfer: bool,
    /// User-facing reply to show while the decision is applied; set whenever
    /// a transfer is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_reason: Option<ToggleReason>,
}

/// Pure decision rule: explicit request wins; otherwise sustained negative
/// sentiment above the confidence bar. Both thresholds are configuration —
/// the AND combination is current policy, not a law.
pub fn transfer_decision(
    needs_human: bool,
    score: f32,
    confidence: f32,
    sentiment_threshold: f32,
    confidence_threshold: f32,
) -> AgentDecision {
    if needs_human {
        return AgentDecision {
            should_transfer: true,
            response: Some(FORWARDED_RESPONSE.to_string()),
            transfer_reason: Some(ToggleReason::CustomerRequest),
        };
    }
    if score < sentiment_threshold && confidence > confidence_threshold {
        return AgentDecision {
            should_transfer: true,
            response: Some(FORWARDED_RESPONSE.to_string()),
            transfer_reason: Some(ToggleReason::SentimentBased),
        };
    }
    AgentDecision {
        should_transfer: false,
        response: None,
        transfer_reason: None,
    }
}

const DETECT_SYS_PROMPT: &str = "You decide whether a customer is explicitly asking to talk \
to a human agent (a real person, staff member, representative). Consider the conversation \
context. Respond with a JSON object: {\"transfer\": true} if the customer is asking for a \
human, {\"transfer\": false} otherwise.";

/// Summary returned to the staff dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub customer_id: String,
    pub current_agent: AgentType,
    pub session_duration_secs: i64,
    pub last_interaction: chrono::DateTime<Utc>,
    pub sentiment_score: f32,
    pub sentiment_confidence: f32,
    pub message_count: u32,
}

pub struct HumanAgentHandler {
    llm: DynLlmClient,
    sessions: Arc<SessionRegistry>,
    histories: Arc<HistoryRegistry>,
    /// How many recent turns go into the staff briefing.
    transfer_context_limit: usize,
}

impl HumanAgentHandler {
    pub fn new(
        llm: DynLlmClient,
        sessions: Arc<SessionRegistry>,
        histories: Arc<HistoryRegistry>,
        transfer_context_limit: usize,
    ) -> Self {
        Self {
            llm,
            sessions,
            histories,
            transfer_context_limit,
        }
    }

    /// Best-effort boolean signal, never authoritative: any LLM failure or
    /// unparseable reply reads as "no request" — the sentiment trigger is
    /// the fallback path for missed requests.
    pub async fn detect_human_request(&self, query: &str, recent_history: &str) -> bool {
        let user_prompt =
            format!("Conversation so far:\n{recent_history}\n\nCustomer message: {query}");
        match self.llm.generate(DETECT_SYS_PROMPT, &user_prompt).await {
            Ok(reply) => parse_transfer_reply(&reply),
            Err(e) => {
                debug!(error = %e, "human-request detection unavailable");
                false
            }
        }
    }

    /// Transfer by session id. `Ok(false)` means the session was not found
    /// and the caller must fall back gracefully.
    pub async fn transfer_to_human(
        &self,
        session_id: &str,
        reason: ToggleReason,
    ) -> Result<bool, ChatError> {
        let Some(shared) = self.sessions.lookup(session_id) else {
            warn!(session_id, "transfer requested for unknown session");
            return Ok(false);
        };
        let mut session = shared.lock().await;
        self.transfer_to_human_locked(&mut session, reason).await
    }

    /// Variant for callers already holding the session lock (the
    /// orchestrator mid-turn). Idempotent: an already-human session returns
    /// success without a duplicate transfer notice.
    pub async fn transfer_to_human_locked(
        &self,
        session: &mut ChatSession,
        reason: ToggleReason,
    ) -> Result<bool, ChatError> {
        // The handler's registry is authoritative for who can be handed off;
        // a session it does not know about cannot reach staff.
        if self.sessions.lookup(&session.session_id).is_none() {
            warn!(session_id = %session.session_id, "transfer requested for unknown session");
            return Ok(false);
        }
        if session.current_agent == AgentType::Human {
            return Ok(true);
        }

        let history = self
            .histories
            .get_or_create(&session.session_id, &session.customer_id);
        let context = history
            .get_transfer_context(self.transfer_context_limit)
            .await?;
        history
            .add_turn(
                MessageRole::System,
                "Chat transferred to human agent",
                Some(json!({
                    "transfer_reason": reason,
                    "transfer_context": context,
                })),
            )
            .await?;

        // Flip only after the notice is durably recorded.
        session.current_agent = AgentType::Human;
        session.touch();
        info!(
            session_id = %session.session_id,
            ?reason,
            "conversation transferred to human agent"
        );
        Ok(true)
    }

    /// Inverse transition, staff-initiated. `Ok(false)` when the session is
    /// already bot-owned; unknown sessions are an explicit error.
    pub async fn transfer_to_bot(&self, session_id: &str) -> Result<bool, ChatError> {
        let Some(shared) = self.sessions.lookup(session_id) else {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        };
        let mut session = shared.lock().await;
        if session.current_agent == AgentType::Bot {
            return Ok(false);
        }

        let history = self
            .histories
            .get_or_create(&session.session_id, &session.customer_id);
        history
            .add_turn(
                MessageRole::System,
                "Chat transferred back to AI assistant",
                Some(json!({ "transfer_reason": ToggleReason::AgentInitiated })),
            )
            .await?;

        session.current_agent = AgentType::Bot;
        session.touch();
        info!(session_id, "conversation transferred back to bot");
        Ok(true)
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, ChatError> {
        let Some(shared) = self.sessions.lookup(session_id) else {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        };
        let session = shared.lock().await;
        Ok(SessionStats {
            session_id: session.session_id.clone(),
            customer_id: session.customer_id.clone(),
            current_agent: session.current_agent,
            session_duration_secs: (Utc::now() - session.start_time).num_seconds(),
            last_interaction: session.last_interaction,
            sentiment_score: session.sentiment_score,
            sentiment_confidence: session.sentiment_confidence,
            message_count: session.message_count,
        })
    }

    /// Drop a finished session from both registries. The durable turn log
    /// is unaffected.
    pub fn close_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.histories.remove(session_id);
    }
}

/// Structured reply first; the legacy first-line `TRANSFER` token is kept as
/// a fallback for providers without JSON output.
fn parse_transfer_reply(reply: &str) -> bool {
    if let Ok(v) = serde_json::from_str::<Value>(reply) {
        if let Some(b) = v.get("transfer").and_then(Value::as_bool) {
            return b;
        }
    }
    reply
        .lines()
        .next()
        .map(|line| line.trim().to_ascii_uppercase().starts_with("TRANSFER"))
        .unwrap_or(false)
}
