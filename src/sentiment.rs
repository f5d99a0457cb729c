//! # Sentiment Analyzer
//! Two-tier sentiment scoring: a deterministic lexicon stage first, with an
//! LLM validator consulted only when the lexicon's confidence is low.
//!
//! The lexicon stage rescales a compound valence from [-1,1] to [0,1] and
//! derives confidence from how polarized the positive/negative/neutral
//! components are. The LLM score is adopted only when it disagrees with the
//! lexicon by more than the configured band, and then confidence is bumped
//! to 0.9 — a low-confidence heuristic is never blindly overridden by a
//! high-confidence one.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::llm::{DynLlmClient, LlmError};

static LEXICON: Lazy<HashMap<String, f32>> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, f32>>(raw).expect("valid sentiment lexicon")
});

/// Normalization constant for the compound score (sum / sqrt(sum^2 + ALPHA)).
const ALPHA: f32 = 15.0;

const VALIDATOR_SYS_PROMPT: &str = "You are a sentiment rater for customer-support messages. \
Rate the sentiment of the user's message as a single number between 0.0 (very negative) \
and 1.0 (very positive). Output ONLY the number, nothing else.";

/// Final analyzer output. `lexicon_score` keeps the pre-validation score so
/// the escalation is auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentScore {
    pub score: f32,
    pub confidence: f32,
    pub lexicon_score: f32,
    pub llm_validated: bool,
}

/// Intermediate lexicon result (compound plus component proportions).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexiconScore {
    pub compound: f32,
    pub pos: f32,
    pub neg: f32,
    pub neu: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    VeryPositive,
    Positive,
    Neutral,
    Negative,
    VeryNegative,
}

/// Deterministic threshold ladder; boundaries are pinned by tests and must
/// stay stable across versions.
pub fn sentiment_label(score: f32) -> SentimentLabel {
    if score >= 0.75 {
        SentimentLabel::VeryPositive
    } else if score >= 0.6 {
        SentimentLabel::Positive
    } else if score >= 0.4 {
        SentimentLabel::Neutral
    } else if score >= 0.25 {
        SentimentLabel::Negative
    } else {
        SentimentLabel::VeryNegative
    }
}

pub struct SentimentAnalyzer {
    llm: DynLlmClient,
    /// Adopt the LLM score only when |llm - lexicon| exceeds this.
    llm_validate_threshold: f32,
}

impl SentimentAnalyzer {
    pub fn new(llm: DynLlmClient, llm_validate_threshold: f32) -> Self {
        Self {
            llm,
            llm_validate_threshold,
        }
    }

    /// Lexicon stage. Negation within the last 1..=3 tokens inverts a word's
    /// valence ("not good" reads negative).
    pub fn score_lexicon(&self, text: &str) -> LexiconScore {
        let tokens: Vec<String> = tokenize(text).collect();
        if tokens.is_empty() {
            return LexiconScore {
                compound: 0.0,
                pos: 0.0,
                neg: 0.0,
                neu: 1.0,
            };
        }

        let mut sum = 0.0f32;
        let mut pos_sum = 0.0f32;
        let mut neg_sum = 0.0f32;
        let mut neu_count = 0.0f32;

        for i in 0..tokens.len() {
            let base = *LEXICON.get(tokens[i].as_str()).unwrap_or(&0.0);
            if base == 0.0 {
                neu_count += 1.0;
                continue;
            }
            let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
            let adj = if negated { -base } else { base };
            sum += adj;
            if adj > 0.0 {
                pos_sum += adj;
            } else {
                neg_sum += -adj;
            }
        }

        let compound = sum / (sum * sum + ALPHA).sqrt();
        let total = pos_sum + neg_sum + neu_count;
        LexiconScore {
            compound,
            pos: pos_sum / total,
            neg: neg_sum / total,
            neu: neu_count / total,
        }
    }

    /// Full analysis: lexicon score, confidence from component polarization,
    /// LLM validation when confidence < 0.5. A failed LLM call degrades to
    /// the lexicon score rather than failing the analysis.
    pub async fn analyze_sentiment(&self, text: &str) -> Result<SentimentScore, ChatError> {
        let lex = self.score_lexicon(text);
        let lexicon_score = (lex.compound + 1.0) / 2.0;
        let mut confidence = clamp01((lex.pos - lex.neg).abs() + (1.0 - lex.neu));

        let (score, llm_validated) = if confidence < 0.5 {
            match self.validate_with_llm(text, lexicon_score).await {
                Ok((validated_score, adopted)) => {
                    if adopted {
                        confidence = 0.9;
                    }
                    (validated_score, adopted)
                }
                Err(e) => {
                    warn!(error = %e, "LLM sentiment validation failed; keeping lexicon score");
                    (lexicon_score, false)
                }
            }
        } else {
            (lexicon_score, false)
        };

        debug!(
            score,
            confidence, lexicon_score, llm_validated, "sentiment analysis complete"
        );
        Ok(SentimentScore {
            score,
            confidence,
            lexicon_score,
            llm_validated,
        })
    }

    /// Ask the validator for a single float; adopt it only on significant
    /// disagreement with the lexicon score.
    async fn validate_with_llm(&self, text: &str, score: f32) -> Result<(f32, bool), LlmError> {
        let reply = self
            .llm
            .generate(VALIDATOR_SYS_PROMPT, &format!("Message: {text}"))
            .await?;
        let llm_score: f32 = reply
            .trim()
            .parse()
            .map_err(|_| LlmError::Malformed { raw: reply })?;
        let llm_score = clamp01(llm_score);

        if (llm_score - score).abs() > self.llm_validate_threshold {
            return Ok((llm_score, true));
        }
        Ok((score, false))
    }
}

fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not"
            | "no"
            | "never"
            | "isn't"
            | "wasn't"
            | "aren't"
            | "won't"
            | "don't"
            | "doesn't"
            | "can't"
            | "cannot"
            | "without"
    )
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use std::sync::Arc;

    fn analyzer_with(llm: MockLlm) -> SentimentAnalyzer {
        SentimentAnalyzer::new(Arc::new(llm), 0.2)
    }

    #[test]
    fn label_boundaries_are_pinned() {
        assert_eq!(sentiment_label(0.75), SentimentLabel::VeryPositive);
        assert_eq!(sentiment_label(0.749), SentimentLabel::Positive);
        assert_eq!(sentiment_label(0.6), SentimentLabel::Positive);
        assert_eq!(sentiment_label(0.59), SentimentLabel::Neutral);
        assert_eq!(sentiment_label(0.4), SentimentLabel::Neutral);
        assert_eq!(sentiment_label(0.25), SentimentLabel::Negative);
        assert_eq!(sentiment_label(0.2499), SentimentLabel::VeryNegative);
    }

    #[test]
    fn positive_text_scores_above_negative_text() {
        let a = analyzer_with(MockLlm::failing());
        let good = a.score_lexicon("Thank you, this was great and really helpful!");
        let bad = a.score_lexicon("This is terrible, awful service, I am very angry.");
        assert!(good.compound > 0.0);
        assert!(bad.compound < 0.0);
        assert!(good.compound > bad.compound);
    }

    #[test]
    fn negation_inverts_valence() {
        let a = analyzer_with(MockLlm::failing());
        let plain = a.score_lexicon("the course was good");
        let negated = a.score_lexicon("the course was not good");
        assert!(plain.compound > 0.0);
        assert!(negated.compound < plain.compound);
    }

    #[test]
    fn neutral_text_has_low_confidence() {
        let a = analyzer_with(MockLlm::failing());
        let lex = a.score_lexicon("the schedule is on the website");
        let confidence = clamp01((lex.pos - lex.neg).abs() + (1.0 - lex.neu));
        assert!(confidence < 0.5);
    }

    #[tokio::test]
    async fn high_confidence_skips_llm() {
        // Failing LLM: if the validator were consulted, the score would
        // degrade; a polarized message must not reach it.
        let a = analyzer_with(MockLlm::failing());
        let out = a
            .analyze_sentiment("terrible awful horrible useless")
            .await
            .unwrap();
        assert!(!out.llm_validated);
        assert!(out.confidence >= 0.5);
        assert!(out.score < 0.5);
    }

    #[tokio::test]
    async fn low_confidence_escalates_and_adopts_on_disagreement() {
        let a = analyzer_with(MockLlm::always("0.1"));
        let out = a
            .analyze_sentiment("the website is slow today maybe")
            .await
            .unwrap();
        assert!(out.llm_validated);
        assert!((out.score - 0.1).abs() < 1e-6);
        assert!((out.confidence - 0.9).abs() < 1e-6);
        assert!(out.lexicon_score > out.score, "lexicon score preserved for audit");
    }

    #[tokio::test]
    async fn llm_score_within_band_is_not_adopted() {
        // Lexicon puts "slow" slightly negative (~0.37); an LLM reading of
        // 0.4 is within the 0.2 band, so the lexicon score stands.
        let a = analyzer_with(MockLlm::always("0.4"));
        let out = a
            .analyze_sentiment("the website is slow today maybe")
            .await
            .unwrap();
        assert!(!out.llm_validated);
        assert!((out.score - out.lexicon_score).abs() < 1e-6);
        assert!(out.confidence < 0.5, "confidence not bumped without adoption");
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_lexicon_score() {
        let a = analyzer_with(MockLlm::failing());
        let out = a
            .analyze_sentiment("the website is slow today maybe")
            .await
            .unwrap();
        assert!(!out.llm_validated);
        assert!((out.score - out.lexicon_score).abs() < 1e-6);
    }

    #[tokio::test]
    async fn garbage_llm_reply_is_treated_as_failure() {
        let a = analyzer_with(MockLlm::always("quite negative I think"));
        let out = a
            .analyze_sentiment("the website is slow today maybe")
            .await
            .unwrap();
        assert!(!out.llm_validated);
    }

    #[test]
    fn empty_text_is_neutral() {
        let a = analyzer_with(MockLlm::failing());
        let lex = a.score_lexicon("");
        assert_eq!(lex.compound, 0.0);
        assert_eq!(lex.neu, 1.0);
    }
}
