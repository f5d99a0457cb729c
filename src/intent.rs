//! Intent classification: one structured-output LLM call per user turn.
//!
//! The model sees the raw query plus a bounded, chronologically ordered
//! transcript and must answer with a JSON object matching `IntentResult`.
//! Output that fails schema validation is a hard error — it is never
//! silently coerced — and the raw output is preserved for prompt-drift
//! diagnosis.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::ChatError;
use crate::llm::{DynLlmClient, LlmError};

/// Closed intent taxonomy for the education domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CourseInquiry,
    ScheduleInquiry,
    FeeInquiry,
    GeneralInquiry,
}

/// Slot values extracted from the query and history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParameters {
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub english_level: Option<String>,
    #[serde(default)]
    pub lexile_score: Option<String>,
    #[serde(default)]
    pub original_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: IntentKind,
    #[serde(default)]
    pub parameters: QueryParameters,
    /// Clarifying question to show when information is missing.
    #[serde(default)]
    pub response: Option<String>,
    /// Slot names still required, in the order they should be asked for.
    #[serde(default)]
    pub missing_info: Vec<String>,
}

const CLASSIFIER_SYS_PROMPT: &str = "You are an intent classifier for an education company's \
customer-support chatbot. Classify the customer's intent and extract parameters. \
Respond with a JSON object: \
{\"intent\": \"course_inquiry\"|\"schedule_inquiry\"|\"fee_inquiry\"|\"general_inquiry\", \
\"parameters\": {\"age\": number|null, \"subject\": string|null, \"english_level\": string|null, \
\"lexile_score\": string|null, \"original_query\": string}, \
\"response\": string|null, \"missing_info\": [string]}. \
If information required for the intent is missing (e.g. the student's age for a course \
inquiry), list the slot names in missing_info and put a short clarifying question in \
response. If nothing is missing, missing_info must be an empty list.";

pub struct IntentClassifier {
    llm: DynLlmClient,
}

impl IntentClassifier {
    pub fn new(llm: DynLlmClient) -> Self {
        Self { llm }
    }

    /// One classify step. `formatted_history` is the bounded `Role: content`
    /// transcript, oldest first.
    pub async fn classify_intent(
        &self,
        query: &str,
        formatted_history: &str,
    ) -> Result<IntentResult, ChatError> {
        let user_prompt = format!(
            "Conversation so far:\n{formatted_history}\n\nCurrent query: {query}"
        );

        let value = match self.llm.generate_json(CLASSIFIER_SYS_PROMPT, &user_prompt).await {
            Ok(v) => v,
            Err(LlmError::Malformed { raw }) => {
                error!(raw, "intent classifier returned non-JSON output");
                return Err(ChatError::SchemaValidation {
                    reason: "expected a JSON object".into(),
                    raw,
                });
            }
            Err(e) => return Err(ChatError::Llm(e)),
        };

        let raw = value.to_string();
        let result: IntentResult =
            serde_json::from_value(value).map_err(|e| {
                error!(raw, error = %e, "intent result failed schema validation");
                ChatError::SchemaValidation {
                    reason: e.to_string(),
                    raw,
                }
            })?;

        info!(
            intent = ?result.intent,
            missing = result.missing_info.len(),
            "intent classified"
        );
        Ok(result)
    }
}
