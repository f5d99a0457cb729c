//! LLM client abstraction: provider trait + OpenAI, disabled and mock
//! implementations.
//!
//! Every remote call is bounded by connect/request timeouts so a stuck
//! provider degrades the conversation instead of hanging it. The factory
//! honors `AI_TEST_MODE=mock` for deterministic local runs and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,

    #[error("llm provider returned status {0}")]
    Http(u16),

    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm is disabled")]
    Disabled,

    #[error("llm returned non-JSON output where JSON was requested")]
    Malformed {
        /// Raw model output, preserved for diagnostics.
        raw: String,
    },
}

/// Chat-completion style client. `generate` returns free text; the
/// structured-output variant `generate_json` asks the provider for a JSON
/// object and returns it unvalidated (callers own schema validation).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;

    async fn generate_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError>;

    /// Provider name for diagnostics/headers.
    fn provider_name(&self) -> &'static str;
}

pub type DynLlmClient = Arc<dyn LlmClient>;

/// Factory: `AI_TEST_MODE=mock` wins; otherwise OpenAI if a key is present,
/// else the disabled client (the pipeline still works, just degraded).
pub fn build_llm_client() -> DynLlmClient {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(MockLlm::always("Mocked assistant reply."));
    }
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Arc::new(OpenAiClient::new(key, None)),
        _ => {
            warn!("OPENAI_API_KEY not set; LLM features disabled");
            Arc::new(DisabledClient)
        }
    }
}

// ------------------------------------------------------------
// OpenAI provider
// ------------------------------------------------------------

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// `model_override`: pass Some("gpt-4o") to override; defaults to gpt-4o-mini.
    pub fn new(api_key: String, model_override: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("edu-support-bot/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
        }
    }

    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_mode: bool,
    ) -> Result<String, LlmError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Format<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<Format<'a>>,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system_prompt,
                },
                Msg {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.2,
            response_format: json_mode.then_some(Format {
                kind: "json_object",
            }),
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(LlmError::Http(resp.status().as_u16()));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(body
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        self.chat(system_prompt, user_prompt, false).await
    }

    async fn generate_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        let raw = self.chat(system_prompt, user_prompt, true).await?;
        serde_json::from_str(&raw).map_err(|_| LlmError::Malformed { raw })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Disabled client
// ------------------------------------------------------------

/// Errors on every call; used when no provider is configured.
pub struct DisabledClient;

#[async_trait]
impl LlmClient for DisabledClient {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::Disabled)
    }

    async fn generate_json(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        Err(LlmError::Disabled)
    }

    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

// ------------------------------------------------------------
// Mock client (tests/local runs)
// ------------------------------------------------------------

enum MockMode {
    /// Same reply for every call.
    Fixed(String),
    /// Pop scripted replies in order; falls back to the last one.
    Scripted(Mutex<VecDeque<String>>),
    /// Every call fails (outage simulation).
    Failing,
}

pub struct MockLlm {
    mode: MockMode,
}

impl MockLlm {
    pub fn always(reply: &str) -> Self {
        Self {
            mode: MockMode::Fixed(reply.to_string()),
        }
    }

    pub fn scripted<I: IntoIterator<Item = String>>(replies: I) -> Self {
        Self {
            mode: MockMode::Scripted(Mutex::new(replies.into_iter().collect())),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: MockMode::Failing,
        }
    }

    fn next_reply(&self) -> Result<String, LlmError> {
        match &self.mode {
            MockMode::Fixed(s) => Ok(s.clone()),
            MockMode::Scripted(q) => {
                let mut q = q.lock().expect("mock queue poisoned");
                match q.len() {
                    0 => Err(LlmError::Transport("mock script exhausted".into())),
                    1 => Ok(q.front().cloned().unwrap_or_default()),
                    _ => Ok(q.pop_front().unwrap_or_default()),
                }
            }
            MockMode::Failing => Err(LlmError::Timeout),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        self.next_reply()
    }

    async fn generate_json(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        let raw = self.next_reply()?;
        serde_json::from_str(&raw).map_err(|_| LlmError::Malformed { raw })
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_mock_pops_in_order_then_repeats_last() {
        let llm = MockLlm::scripted(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(llm.generate("s", "u").await.unwrap(), "one");
        assert_eq!(llm.generate("s", "u").await.unwrap(), "two");
        assert_eq!(llm.generate("s", "u").await.unwrap(), "two");
    }

    #[tokio::test]
    async fn failing_mock_errors() {
        let llm = MockLlm::failing();
        assert!(llm.generate("s", "u").await.is_err());
    }

    #[tokio::test]
    async fn mock_json_validates_json() {
        let llm = MockLlm::always(r#"{"transfer": true}"#);
        let v = llm.generate_json("s", "u").await.unwrap();
        assert_eq!(v["transfer"], serde_json::json!(true));

        let bad = MockLlm::always("TRANSFER");
        match bad.generate_json("s", "u").await {
            Err(LlmError::Malformed { raw }) => assert_eq!(raw, "TRANSFER"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
