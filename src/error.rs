//! Error taxonomy for the chat core.
//!
//! The distinctions matter to callers: a `SessionNotFound` must not be
//! retried as if it were transient, a transient `Llm`/`Store` failure has a
//! degraded fallback at the point of use, and a `SchemaValidation` failure is
//! a hard error carrying the raw LLM output for prompt-drift diagnosis.

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("llm output failed schema validation: {reason}")]
    SchemaValidation {
        reason: String,
        /// Raw model output, kept verbatim for diagnostics. Never shown to
        /// the end user.
        raw: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Transient failures may succeed on retry; not-found and schema errors
    /// will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Llm(_) | ChatError::Store(_))
    }
}
