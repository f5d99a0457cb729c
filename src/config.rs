//! Runtime configuration for the chat core, loaded from `config/chat.toml`.
//!
//! Every tunable the orchestrator reads lives here: session timeout, analysis
//! cadence, transfer thresholds, prompt window, and the trigger-pattern table.
//! Missing fields fall back to serde defaults so a partial file (or none at
//! all) still yields a usable config.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::ChatError;

pub const DEFAULT_CONFIG_PATH: &str = "config/chat.toml";
pub const ENV_CONFIG_PATH: &str = "CHAT_CONFIG_PATH";

fn default_session_timeout_hours() -> i64 {
    24
}
fn default_min_message_length() -> usize {
    10
}
fn default_analysis_interval() -> u32 {
    5
}
fn default_sentiment_threshold() -> f32 {
    0.3
}
fn default_confidence_threshold() -> f32 {
    0.7
}
fn default_llm_validate_threshold() -> f32 {
    0.2
}
fn default_max_turns_for_prompt() -> usize {
    30
}
fn default_retrieval_top_k() -> usize {
    5
}
fn default_semantic_weight() -> f32 {
    0.7
}
fn default_keyword_weight() -> f32 {
    0.3
}

fn default_trigger_patterns() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(
        "urgency".to_string(),
        r"\b(urgent|urgently|asap|immediately|right now|emergency)\b".to_string(),
    );
    m.insert(
        "frustration".to_string(),
        r"\b(frustrat\w*|annoy\w*|angry|upset|ridiculous|unacceptable)\b".to_string(),
    );
    m.insert(
        "negative".to_string(),
        r"\b(terrible|awful|horrible|worst|useless|waste)\b".to_string(),
    );
    m
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// A customer message after this many idle hours starts a new session.
    #[serde(default = "default_session_timeout_hours")]
    pub session_timeout_hours: i64,
    /// Messages shorter than this never get sentiment analysis.
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
    /// Force a full analysis at least every N messages.
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval: u32,
    /// Transfer to a human when score drops below this...
    #[serde(default = "default_sentiment_threshold")]
    pub sentiment_threshold: f32,
    /// ...and the analysis confidence exceeds this.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Adopt the LLM validator's score only when it disagrees with the
    /// lexicon score by more than this.
    #[serde(default = "default_llm_validate_threshold")]
    pub llm_validate_threshold: f32,
    /// How many recent turns go into LLM prompt windows.
    #[serde(default = "default_max_turns_for_prompt")]
    pub max_turns_for_prompt: usize,
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    /// Trigger regexes keyed by category (e.g. "urgency"); matched
    /// case-insensitively against the raw message.
    #[serde(default = "default_trigger_patterns")]
    pub trigger_patterns: BTreeMap<String, String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            session_timeout_hours: default_session_timeout_hours(),
            min_message_length: default_min_message_length(),
            analysis_interval: default_analysis_interval(),
            sentiment_threshold: default_sentiment_threshold(),
            confidence_threshold: default_confidence_threshold(),
            llm_validate_threshold: default_llm_validate_threshold(),
            max_turns_for_prompt: default_max_turns_for_prompt(),
            retrieval_top_k: default_retrieval_top_k(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            trigger_patterns: default_trigger_patterns(),
        }
    }
}

impl ChatConfig {
    /// Load from a TOML file. A missing file yields defaults; a present but
    /// malformed file is an error (silent fallback would hide typos).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return Ok(Self::default()),
        };
        let mut cfg: ChatConfig = toml::from_str(&raw)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Load from `CHAT_CONFIG_PATH` or the default location.
    pub fn load() -> Result<Self, ChatError> {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_file(path)
    }

    fn sanitize(&mut self) {
        self.sentiment_threshold = self.sentiment_threshold.clamp(0.0, 1.0);
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.llm_validate_threshold = self.llm_validate_threshold.clamp(0.0, 1.0);
        self.semantic_weight = self.semantic_weight.clamp(0.0, 1.0);
        self.keyword_weight = self.keyword_weight.clamp(0.0, 1.0);
        if self.session_timeout_hours <= 0 {
            self.session_timeout_hours = default_session_timeout_hours();
        }
        if self.analysis_interval == 0 {
            self.analysis_interval = 1;
        }
        if self.max_turns_for_prompt == 0 {
            self.max_turns_for_prompt = default_max_turns_for_prompt();
        }
        if self.retrieval_top_k == 0 {
            self.retrieval_top_k = 1;
        }
    }

    /// Compile the trigger table. Fails on the first invalid pattern so a
    /// broken config is caught at startup, not mid-conversation.
    pub fn compile_triggers(&self) -> Result<Vec<(String, Regex)>, ChatError> {
        let mut out = Vec::with_capacity(self.trigger_patterns.len());
        for (category, pattern) in &self.trigger_patterns {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ChatError::Config(format!("trigger pattern '{category}': {e}"))
                })?;
            out.push((category.clone(), re));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.session_timeout_hours, 24);
        assert_eq!(cfg.min_message_length, 10);
        assert_eq!(cfg.analysis_interval, 5);
        assert!(cfg.sentiment_threshold < cfg.confidence_threshold);
        assert!(cfg.trigger_patterns.contains_key("urgency"));
        assert!(cfg.trigger_patterns.contains_key("frustration"));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: ChatConfig = toml::from_str("analysis_interval = 3").unwrap();
        assert_eq!(cfg.analysis_interval, 3);
        assert_eq!(cfg.min_message_length, 10);
        assert_eq!(cfg.max_turns_for_prompt, 30);
    }

    #[test]
    fn triggers_compile_and_match_case_insensitively() {
        let cfg = ChatConfig::default();
        let triggers = cfg.compile_triggers().unwrap();
        let urgency = triggers
            .iter()
            .find(|(c, _)| c == "urgency")
            .map(|(_, re)| re)
            .unwrap();
        assert!(urgency.is_match("I need this ASAP please"));
        assert!(!urgency.is_match("just browsing courses"));
    }

    #[test]
    fn invalid_trigger_pattern_is_a_config_error() {
        let mut cfg = ChatConfig::default();
        cfg.trigger_patterns
            .insert("broken".into(), "(unclosed".into());
        assert!(cfg.compile_triggers().is_err());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut cfg = ChatConfig::default();
        cfg.sentiment_threshold = 2.0;
        cfg.semantic_weight = -0.5;
        cfg.keyword_weight = 7.0;
        cfg.retrieval_top_k = 0;
        cfg.analysis_interval = 0;
        cfg.sanitize();
        assert_eq!(cfg.sentiment_threshold, 1.0);
        assert_eq!(cfg.semantic_weight, 0.0);
        assert_eq!(cfg.keyword_weight, 1.0);
        assert_eq!(cfg.retrieval_top_k, 1);
        assert_eq!(cfg.analysis_interval, 1);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ChatConfig::load_from_file("does/not/exist.toml").unwrap();
        assert_eq!(cfg.analysis_interval, ChatConfig::default().analysis_interval);
    }
}
