//! Analysis-gating policy: decides how much sentiment work a message gets.
//!
//! Full sentiment analysis (lexicon plus possible LLM validation) is the most
//! expensive per-message operation, so messages go through a three-tier
//! funnel: a keyword/trigger quick check, a periodic-cadence gate, and only
//! then the full pass. Trigger matches always force analysis — no message
//! with an urgency or frustration signature is ever skipped.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::sentiment::{SentimentAnalyzer, SentimentScore};

/// Which tier produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    QuickCheck,
    Skipped,
    FullAnalysis,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub score: f32,
    pub confidence: f32,
    pub method_used: AnalysisMethod,
    pub full_analysis: bool,
    pub triggers_detected: Vec<String>,
    /// Present only for full analyses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<SentimentScore>,
}

impl AnalysisResult {
    /// Neutral-positive default for messages the funnel skips.
    fn skipped(triggers: Vec<String>) -> Self {
        Self {
            score: 0.7,
            confidence: 0.5,
            method_used: AnalysisMethod::Skipped,
            full_analysis: false,
            triggers_detected: triggers,
            details: None,
        }
    }
}

/// Polite markers that short-circuit to an optimistic score.
const POLITE_KEYWORDS: [&str; 4] = ["thank", "good", "great", "excellent"];

pub struct MessageAnalyzer {
    triggers: Vec<(String, Regex)>,
    min_message_length: usize,
    analysis_interval: u32,
    sentiment: Arc<SentimentAnalyzer>,
}

impl MessageAnalyzer {
    pub fn new(cfg: &ChatConfig, sentiment: Arc<SentimentAnalyzer>) -> Result<Self, ChatError> {
        Ok(Self {
            triggers: cfg.compile_triggers()?,
            min_message_length: cfg.min_message_length,
            analysis_interval: cfg.analysis_interval,
            sentiment,
        })
    }

    /// Trigger categories matching the message (e.g. "urgency").
    pub fn check_triggers(&self, message: &str) -> Vec<String> {
        self.triggers
            .iter()
            .filter(|(_, re)| re.is_match(message))
            .map(|(category, _)| category.clone())
            .collect()
    }

    /// Cheap heuristic pre-filter. `None` means inconclusive.
    fn quick_sentiment_check(&self, message: &str, triggers: &[String]) -> Option<f32> {
        if message.chars().count() < self.min_message_length {
            return None;
        }
        let lower = message.to_lowercase();
        if POLITE_KEYWORDS.iter().any(|w| lower.contains(w)) {
            return Some(0.8);
        }
        if !triggers.is_empty() {
            return Some(0.3);
        }
        None
    }

    /// Pure gate: same inputs, same answer.
    /// Short messages never qualify; triggers always do; otherwise every
    /// `analysis_interval`-th message re-baselines the sentiment.
    pub fn should_analyze_message(
        &self,
        message: &str,
        message_count: u32,
        last_analyzed_index: u32,
    ) -> bool {
        if message.chars().count() < self.min_message_length {
            return false;
        }
        if !self.check_triggers(message).is_empty() {
            return true;
        }
        message_count.saturating_sub(last_analyzed_index) >= self.analysis_interval
    }

    /// Run the funnel. Never fails: a failing full pass degrades to the
    /// skipped default so one flaky LLM call cannot stall the pipeline.
    pub async fn analyze(
        &self,
        message: &str,
        message_count: u32,
        last_analyzed_index: u32,
    ) -> AnalysisResult {
        let triggers = self.check_triggers(message);

        if let Some(quick_score) = self.quick_sentiment_check(message, &triggers) {
            return AnalysisResult {
                score: quick_score,
                confidence: 0.7,
                method_used: AnalysisMethod::QuickCheck,
                full_analysis: false,
                triggers_detected: triggers,
                details: None,
            };
        }

        if !self.should_analyze_message(message, message_count, last_analyzed_index) {
            return AnalysisResult::skipped(triggers);
        }

        match self.sentiment.analyze_sentiment(message).await {
            Ok(details) => AnalysisResult {
                score: details.score,
                confidence: details.confidence,
                method_used: AnalysisMethod::FullAnalysis,
                full_analysis: true,
                triggers_detected: triggers,
                details: Some(details),
            },
            Err(e) => {
                warn!(error = %e, "full sentiment analysis failed; using skipped default");
                AnalysisResult::skipped(triggers)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn mk_analyzer() -> MessageAnalyzer {
        let cfg = ChatConfig::default();
        let sentiment = Arc::new(SentimentAnalyzer::new(
            Arc::new(MockLlm::failing()),
            cfg.llm_validate_threshold,
        ));
        MessageAnalyzer::new(&cfg, sentiment).unwrap()
    }

    #[test]
    fn gate_is_deterministic() {
        let a = mk_analyzer();
        let msg = "when does the next algebra course start?";
        let first = a.should_analyze_message(msg, 7, 2);
        for _ in 0..10 {
            assert_eq!(a.should_analyze_message(msg, 7, 2), first);
        }
    }

    #[test]
    fn short_messages_are_never_analyzed() {
        let a = mk_analyzer();
        assert!(!a.should_analyze_message("ok", 100, 0));
        // Even with a trigger word, length wins first.
        assert!(!a.should_analyze_message("asap", 100, 0));
    }

    #[test]
    fn triggers_force_analysis_regardless_of_cadence() {
        let a = mk_analyzer();
        assert!(a.should_analyze_message("I need this fixed immediately please", 1, 0));
        let cats = a.check_triggers("this is urgent and really frustrating");
        assert!(cats.contains(&"urgency".to_string()));
        assert!(cats.contains(&"frustration".to_string()));
    }

    #[test]
    fn cadence_gate_counts_from_last_analyzed_index() {
        let a = mk_analyzer();
        let msg = "could you tell me about the fees?";
        // interval is 5 by default
        assert!(!a.should_analyze_message(msg, 4, 0));
        assert!(a.should_analyze_message(msg, 5, 0));
        assert!(!a.should_analyze_message(msg, 9, 5));
        assert!(a.should_analyze_message(msg, 10, 5));
    }

    #[tokio::test]
    async fn polite_keywords_win_the_quick_check() {
        let a = mk_analyzer();
        let out = a.analyze("thank you, that was great!", 1, 0).await;
        assert_eq!(out.method_used, AnalysisMethod::QuickCheck);
        assert!((out.score - 0.8).abs() < 1e-6);
        assert!((out.confidence - 0.7).abs() < 1e-6);
        assert!(!out.full_analysis);
    }

    #[tokio::test]
    async fn triggers_quick_check_scores_pessimistic() {
        let a = mk_analyzer();
        let out = a.analyze("this is urgent, respond immediately", 1, 0).await;
        assert_eq!(out.method_used, AnalysisMethod::QuickCheck);
        assert!((out.score - 0.3).abs() < 1e-6);
        assert!(!out.triggers_detected.is_empty());
    }

    #[tokio::test]
    async fn off_cadence_messages_are_skipped() {
        let a = mk_analyzer();
        let out = a.analyze("what books does the reading club use?", 2, 0).await;
        assert_eq!(out.method_used, AnalysisMethod::Skipped);
        assert!((out.score - 0.7).abs() < 1e-6);
        assert!((out.confidence - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn short_messages_fall_through_to_skipped() {
        let a = mk_analyzer();
        let out = a.analyze("thanks", 100, 0).await;
        assert_eq!(out.method_used, AnalysisMethod::Skipped);
    }

    #[tokio::test]
    async fn cadence_reached_runs_full_analysis() {
        let a = mk_analyzer();
        // Neutral phrasing: no polite keywords, no triggers; count at interval.
        let out = a.analyze("my child is struggling with the homework", 5, 0).await;
        assert_eq!(out.method_used, AnalysisMethod::FullAnalysis);
        assert!(out.full_analysis);
        assert!(out.details.is_some());
    }
}
