//! Typed error hierarchy for the foreman engine.
//!
//! Four top-level enums cover the subsystems:
//! - `BudgetError`: token/wall-clock accounting failures
//! - `ContextError`: context selection failures
//! - `PatchError`: patch validation and governed application failures
//! - `OrchestratorError`: run/phase scheduling failures
//!
//! The error taxonomy mirrors the recovery policy: transient errors are
//! retried with backoff, malformed output triggers a strategy change,
//! budget exhaustion is fatal to the run, and governance violations are
//! always rejected outright.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the budget tracker.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Token budget exhausted: {used} of {cap} tokens consumed")]
    TokensExhausted { used: u64, cap: u64 },

    #[error("Wall-clock budget exhausted after {elapsed_secs}s (cap: {cap_secs}s)")]
    WallClockExhausted { elapsed_secs: u64, cap_secs: u64 },
}

/// Errors from the context selector.
#[derive(Debug, Error)]
pub enum ContextError {
    /// No embedding backend configured. Selection fails closed rather than
    /// degrading to a non-semantic ranking, since irrelevant context directly
    /// causes hallucinated edits.
    #[error("No embedding backend configured; refusing non-semantic fallback")]
    NoEmbeddingBackend,

    #[error("Token budget for context selection must be non-zero")]
    ZeroTokenBudget,

    #[error("Embedding backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Errors from governed patch validation and application.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The diff text does not parse as a unified diff, or shows signs of
    /// incomplete generation. Distinguishable from a generic failure so the
    /// review loop can retry with an explicit instruction.
    #[error("Malformed patch: {reason}")]
    Malformed { reason: String },

    /// A touched path falls outside the phase's declared file scope. The
    /// whole patch is rejected; governance violations are never narrowed.
    #[error("Patch touches path outside declared scope: {path}")]
    ScopeViolation { path: PathBuf },

    #[error("Patch application failed: {0}")]
    ApplyFailed(#[source] git2::Error),

    #[error("Commit {commit} not found for rollback")]
    CommitNotFound { commit: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PatchError {
    /// Whether this error indicates malformed LLM output (as opposed to a
    /// governance or infrastructure failure).
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Whether this error is a governance violation.
    pub fn is_scope_violation(&self) -> bool {
        matches!(self, Self::ScopeViolation { .. })
    }
}

/// Errors from the run/phase orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run is not in a dispatchable state: {state}")]
    InvalidRunState { state: String },

    #[error("Phase {phase} is already executing (single-owner lock held)")]
    PhaseAlreadyExecuting { phase: String },

    #[error("Phase {phase} declares an empty file scope")]
    EmptyScope { phase: String },

    #[error("Unknown phase: {phase}")]
    UnknownPhase { phase: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_error_malformed_is_distinguishable() {
        let err = PatchError::Malformed {
            reason: "truncation marker at line 12".into(),
        };
        assert!(err.is_malformed());
        assert!(!err.is_scope_violation());
        assert!(err.to_string().contains("truncation marker"));
    }

    #[test]
    fn patch_error_scope_violation_carries_path() {
        let err = PatchError::ScopeViolation {
            path: PathBuf::from("src/secrets.rs"),
        };
        assert!(err.is_scope_violation());
        assert!(err.to_string().contains("src/secrets.rs"));
    }

    #[test]
    fn budget_error_carries_usage() {
        let err = BudgetError::TokensExhausted { used: 1200, cap: 1000 };
        assert!(err.to_string().contains("1200"));
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn context_error_fail_closed_variant() {
        let err = ContextError::NoEmbeddingBackend;
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BudgetError::TokensExhausted { used: 1, cap: 1 });
        assert_std_error(&ContextError::ZeroTokenBudget);
        assert_std_error(&PatchError::Malformed { reason: "x".into() });
        assert_std_error(&OrchestratorError::Cancelled);
    }
}
