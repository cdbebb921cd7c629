//! Run orchestration: event fan-out and the run-level scheduler.

pub mod events;
pub mod runner;

pub use events::{EventBus, StateEvent};
pub use runner::{AdvanceOutcome, CancelToken, Orchestrator, RunReport};
