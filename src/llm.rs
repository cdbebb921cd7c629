//! LLM call capability.
//!
//! The engine treats the model provider as an external collaborator behind
//! a trait: one call surface covering both roles, returning the raw text
//! and the tokens actually consumed. Provider selection, transport-level
//! retries, and model routing by task complexity live behind concrete
//! implementations chosen at run-creation time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextBundle;

/// Role the model is asked to play for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmRole {
    /// Proposes a candidate patch.
    Builder,
    /// Reviews a candidate patch and returns a verdict.
    Auditor,
}

/// Raw outcome of one LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The model's text output; parsed by the review loop.
    pub text: String,
    /// Tokens actually consumed, reconciled against the budget reservation.
    pub tokens_used: u64,
}

/// Call failures, split along the retry-policy boundary.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Timeout, rate limit, connection reset. Retried with backoff under
    /// the same strategy.
    #[error("Transient LLM failure: {0}")]
    Transient(String),

    /// Provider rejected the request outright (bad auth, invalid model).
    /// Not retryable at this layer.
    #[error("LLM provider failure: {0}")]
    Provider(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The capability the engine depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Invoke the model in the given role with an assembled prompt and the
    /// context bundle the prompt was built from.
    async fn call(
        &self,
        role: LlmRole,
        prompt: &str,
        context: &ContextBundle,
    ) -> Result<LlmResponse, LlmError>;

    /// Estimated token cost for a call, reserved against the budget before
    /// the call begins. The 4-chars-per-token heuristic matches the
    /// bundle's own accounting.
    fn estimate_tokens(&self, prompt: &str, context: &ContextBundle) -> u64 {
        (prompt.len() as u64 / 4) + context.total_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_classification() {
        assert!(LlmError::Transient("rate limited".into()).is_transient());
        assert!(!LlmError::Provider("bad key".into()).is_transient());
    }

    #[test]
    fn test_role_serde_names() {
        assert_eq!(serde_json::to_string(&LlmRole::Builder).unwrap(), "\"builder\"");
        assert_eq!(serde_json::to_string(&LlmRole::Auditor).unwrap(), "\"auditor\"");
    }
}
