//! Foreman: an autonomous build-orchestration engine.
//!
//! A run executes a sequence of phases against a git working tree. Each
//! phase flows through context selection, a builder/auditor review loop,
//! and governed patch application, under run-level token and wall-clock
//! budgets. Failures are journaled as incidents whose derived prevention
//! rules feed back into subsequent prompts.
//!
//! The crate is headless: LLM providers, embedding backends, and user
//! interfaces plug in through the `LlmClient` and `EmbeddingBackend`
//! traits and the orchestrator's event bus.

pub mod budget;
pub mod config;
pub mod context;
pub mod errors;
pub mod graph;
pub mod journal;
pub mod llm;
pub mod orchestrator;
pub mod patch;
pub mod review;
pub mod run;
pub mod telemetry;

pub use budget::BudgetTracker;
pub use config::ForemanConfig;
pub use context::{ContextBundle, ContextSelector, EmbeddingBackend, RepoSnapshot};
pub use errors::{BudgetError, ContextError, OrchestratorError, PatchError};
pub use graph::{GraphBuilder, PhaseGraph};
pub use journal::{Incident, IncidentCategory, IncidentJournal};
pub use llm::{LlmClient, LlmError, LlmResponse, LlmRole};
pub use orchestrator::{AdvanceOutcome, CancelToken, Orchestrator, RunReport, StateEvent};
pub use review::{ReviewLoop, ReviewLoopConfig, ReviewOutcome};
pub use run::{Phase, PhaseState, Run, RunState, SafetyProfile};
