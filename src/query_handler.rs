//! Per-turn orchestration: one inbound customer message in, one reply out.
//!
//! `handle_query` is the only entry point the API layer calls. It is
//! infallible to its caller: every internal failure is mapped to a fixed
//! fallback string, and whatever happens the customer gets a non-empty
//! reply. The per-session mutex is held for the whole turn, so concurrent
//! calls for the same session serialize and the handoff state machine can
//! never double-fire.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::MutexGuard;
use tracing::{error, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::handoff::{transfer_decision, HumanAgentHandler, ToggleReason};
pub use crate::handoff::FORWARDED_RESPONSE;
use crate::history::{ChatHistory, HistoryRegistry, MessageRole};
use crate::intent::{IntentClassifier, IntentResult};
use crate::llm::DynLlmClient;
use crate::msg_analyzer::MessageAnalyzer;
use crate::retrieval::HybridRetriever;
use crate::sentiment::sentiment_label;
use crate::session::{AgentType, ChatSession, SessionRegistry};
use crate::store::TurnStore;

/// Sent when a transfer was warranted but could not be completed.
pub const STAFF_BUSY_RESPONSE: &str =
    "All our staff are currently busy, I'll continue to assist you in the meantime.";

/// Last-resort reply when the pipeline itself fails.
pub const APOLOGY_RESPONSE: &str =
    "I'm sorry, something went wrong on our side. Could you please send your message again?";

const RESPONSE_SYS_PROMPT: &str = "You are a friendly customer-support assistant for an \
education company. Answer the customer's question using only the knowledge-base excerpts \
provided. If the excerpts do not contain the answer, say so honestly and offer to connect \
the customer with a human agent. Keep answers concise and concrete.";

pub struct QueryHandler {
    cfg: ChatConfig,
    llm: DynLlmClient,
    store: Arc<dyn TurnStore>,
    sessions: Arc<SessionRegistry>,
    histories: Arc<HistoryRegistry>,
    analyzer: Arc<MessageAnalyzer>,
    intent: Arc<IntentClassifier>,
    retriever: Arc<HybridRetriever>,
    handoff: Arc<HumanAgentHandler>,
}

impl QueryHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ChatConfig,
        llm: DynLlmClient,
        store: Arc<dyn TurnStore>,
        sessions: Arc<SessionRegistry>,
        histories: Arc<HistoryRegistry>,
        analyzer: Arc<MessageAnalyzer>,
        intent: Arc<IntentClassifier>,
        retriever: Arc<HybridRetriever>,
        handoff: Arc<HumanAgentHandler>,
    ) -> Self {
        Self {
            cfg,
            llm,
            store,
            sessions,
            histories,
            analyzer,
            intent,
            retriever,
            handoff,
        }
    }

    /// One conversation turn. Never returns an error and never returns an
    /// empty string; callers can hand the result straight to the customer.
    pub async fn handle_query(&self, message: &str, session_id: &str, customer_id: &str) -> String {
        counter!("chat_queries_total").increment(1);
        info!(
            session_id,
            msg = %anon_hash(message),
            "handling customer query"
        );

        let shared = self.sessions.get_or_create(session_id, customer_id);
        // Held until the reply is decided: serializes turns per session.
        let mut session = shared.lock().await;
        let history = self.histories.get_or_create(session_id, customer_id);

        let reply = match self.run_turn(message, &mut session, &history).await {
            Ok(reply) => reply,
            Err(e) => {
                counter!("chat_turn_failures_total").increment(1);
                error!(session_id, error = %e, "turn failed; returning apology");
                // Best effort: the apology should appear in the transcript,
                // but a dead store must not swallow the reply itself.
                if let Err(store_err) = history
                    .add_turn(MessageRole::Bot, APOLOGY_RESPONSE, None)
                    .await
                {
                    warn!(session_id, error = %store_err, "could not persist apology turn");
                }
                APOLOGY_RESPONSE.to_string()
            }
        };

        if let Err(e) = self.store.upsert_session(&session).await {
            warn!(session_id, error = %e, "session snapshot write failed");
        }
        reply
    }

    async fn run_turn(
        &self,
        message: &str,
        session: &mut MutexGuard<'_, ChatSession>,
        history: &Arc<ChatHistory>,
    ) -> Result<String, ChatError> {
        session.message_count += 1;
        session.touch();

        // Human-owned sessions bypass the whole pipeline: no analysis, no
        // model calls, just a durable record of what the customer said.
        if session.current_agent == AgentType::Human {
            history.add_turn(MessageRole::User, message, None).await?;
            return Ok(FORWARDED_RESPONSE.to_string());
        }

        // Transcript *before* this message; the query travels separately.
        let recent = history.format_history_for_prompt(self.cfg.max_turns_for_prompt);

        let analysis = self
            .analyzer
            .analyze(message, session.message_count, session.last_analyzed_msg_index)
            .await;
        if analysis.full_analysis {
            session.last_analyzed_msg_index = session.message_count;
        }
        session.sentiment_score = analysis.score;
        session.sentiment_confidence = analysis.confidence;

        let needs_human = self.handoff.detect_human_request(message, &recent).await;
        let decision = transfer_decision(
            needs_human,
            analysis.score,
            analysis.confidence,
            self.cfg.sentiment_threshold,
            self.cfg.confidence_threshold,
        );

        // Exactly one USER turn per call, whichever branch follows.
        history
            .add_turn(
                MessageRole::User,
                message,
                Some(json!({
                    "sentiment_score": analysis.score,
                    "sentiment_confidence": analysis.confidence,
                    "sentiment_label": sentiment_label(analysis.score),
                    "analysis_method": analysis.method_used,
                    "triggers_detected": analysis.triggers_detected,
                })),
            )
            .await?;

        if decision.should_transfer {
            let reason = decision
                .transfer_reason
                .unwrap_or(ToggleReason::SentimentBased);
            let reply = decision
                .response
                .unwrap_or_else(|| FORWARDED_RESPONSE.to_string());
            return self.attempt_transfer(session, history, reason, reply).await;
        }

        let intent = self.intent.classify_intent(message, &recent).await?;

        if !intent.missing_info.is_empty() {
            let question = clarifying_question(&intent);
            history
                .add_turn(
                    MessageRole::Bot,
                    &question,
                    Some(json!({
                        "intent": intent.intent,
                        "missing_info": intent.missing_info,
                    })),
                )
                .await?;
            return Ok(question);
        }

        let hits = self.retriever.search(message).await?;
        let (context, top_result) = HybridRetriever::format_search_results(&hits);

        let user_prompt = format!(
            "Knowledge base excerpts:\n{context}\n\nConversation so far:\n{recent}\n\n\
             Detected intent: {intent:?}\n\nCustomer question: {message}",
            intent = intent.intent,
        );
        let answer = self.llm.generate(RESPONSE_SYS_PROMPT, &user_prompt).await?;

        history
            .add_turn(
                MessageRole::Bot,
                &answer,
                Some(json!({
                    "intent": intent.intent,
                    "top_result": top_result,
                })),
            )
            .await?;
        Ok(answer)
    }

    /// Hand the session to staff; when that fails the bot keeps the
    /// conversation and says so.
    async fn attempt_transfer(
        &self,
        session: &mut MutexGuard<'_, ChatSession>,
        history: &Arc<ChatHistory>,
        reason: ToggleReason,
        reply: String,
    ) -> Result<String, ChatError> {
        let transferred = match self.handoff.transfer_to_human_locked(session, reason).await {
            Ok(done) => done,
            Err(e) if e.is_transient() => {
                warn!(session_id = %session.session_id, error = %e, "transfer attempt failed");
                false
            }
            Err(e) => return Err(e),
        };

        if transferred {
            counter!("chat_transfers_total").increment(1);
            return Ok(reply);
        }

        counter!("chat_transfer_fallbacks_total").increment(1);
        history
            .add_turn(
                MessageRole::System,
                STAFF_BUSY_RESPONSE,
                Some(json!({ "event": "transfer_failed", "transfer_reason": reason })),
            )
            .await?;
        Ok(STAFF_BUSY_RESPONSE.to_string())
    }
}

fn clarifying_question(intent: &IntentResult) -> String {
    match &intent.response {
        Some(q) if !q.trim().is_empty() => q.clone(),
        _ => format!(
            "To better assist you, could you tell me your {}?",
            intent.missing_info.join(", ")
        ),
    }
}

/// Short stable digest so logs never carry raw customer text.
fn anon_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_hash_is_stable_and_short() {
        assert_eq!(anon_hash("hello"), anon_hash("hello"));
        assert_ne!(anon_hash("hello"), anon_hash("hella"));
        assert_eq!(anon_hash("hello").len(), 12);
    }

    #[test]
    fn clarifying_question_prefers_the_model_wording() {
        let mut intent = IntentResult {
            intent: crate::intent::IntentKind::CourseInquiry,
            parameters: Default::default(),
            response: Some("How old is the student?".into()),
            missing_info: vec!["age".into()],
        };
        assert_eq!(clarifying_question(&intent), "How old is the student?");

        intent.response = None;
        assert!(clarifying_question(&intent).contains("age"));
    }
}
