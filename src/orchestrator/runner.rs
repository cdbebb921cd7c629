//! Run-level scheduling: dispatch gating, stale recovery, finalization.
//!
//! The orchestrator owns the run exclusively. A phase is dispatched only
//! when every dependency is Complete, its file scope is disjoint from
//! every executing phase, and no other attempt holds it (the Queued to
//! Executing transition is the ownership lock). Phase execution itself is
//! delegated to the review loop; this module decides what runs next and
//! what a failure means for the rest of the run.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::budget::BudgetTracker;
use crate::config::ForemanConfig;
use crate::context::{ContextSelector, RepoSnapshot};
use crate::errors::OrchestratorError;
use crate::graph::{GraphBuilder, PhaseGraph, PhaseIndex};
use crate::journal::{Incident, IncidentCategory, IncidentJournal};
use crate::llm::LlmClient;
use crate::orchestrator::events::{EventBus, StateEvent};
use crate::patch::{GitWorkspace, ScopeSet};
use crate::review::{ReviewLoop, ReviewLoopConfig, ReviewOutcome};
use crate::run::{Phase, PhaseState, Run, RunState};

/// Cooperative cancellation handle, cloneable across tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final record of a run, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Run,
    pub phases: Vec<Phase>,
    pub incidents: Vec<crate::journal::Incident>,
}

impl RunReport {
    /// One-line outcome summary, also used as the partial-success reason.
    pub fn summary(&self) -> String {
        let complete: Vec<&str> = self
            .phases
            .iter()
            .filter(|p| p.state.is_complete())
            .map(|p| p.id.as_str())
            .collect();
        let failed: Vec<&str> = self
            .phases
            .iter()
            .filter(|p| matches!(p.state, PhaseState::Failed { .. }))
            .map(|p| p.id.as_str())
            .collect();
        format!(
            "{} of {} phases complete{}",
            complete.len(),
            self.phases.len(),
            if failed.is_empty() {
                String::new()
            } else {
                format!("; failed: {}", failed.join(", "))
            }
        )
    }

    /// Write the report as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }
}

/// What a single dispatch resolved to, from the run's point of view.
#[derive(Debug)]
enum DispatchResult {
    Completed,
    PhaseFailed,
}

/// Result of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A phase was dispatched and reached a terminal state.
    Dispatched,
    /// The run reached a terminal state.
    Finished,
}

pub struct Orchestrator {
    project_dir: PathBuf,
    config: ForemanConfig,
    run: Run,
    graph: PhaseGraph,
    budget: BudgetTracker,
    journal: Arc<IncidentJournal>,
    review: ReviewLoop,
    workspace: GitWorkspace,
    events: EventBus,
    cancel: CancelToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_dir", &self.project_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Validate the phase definitions and assemble a run. The project
    /// directory must be a git repository.
    pub fn new(
        project_dir: &Path,
        config: ForemanConfig,
        phases: Vec<Phase>,
        llm: Arc<dyn LlmClient>,
        selector: ContextSelector,
    ) -> Result<Self, OrchestratorError> {
        if let Some(phase) = phases.iter().find(|p| p.scope.is_empty()) {
            return Err(OrchestratorError::EmptyScope {
                phase: phase.id.clone(),
            });
        }
        let graph = GraphBuilder::new(phases)
            .build()
            .map_err(OrchestratorError::Other)?;
        let phase_order: Vec<String> = graph.phases().iter().map(|p| p.id.clone()).collect();

        let run = Run::new(
            phase_order,
            config.budgets.token_cap,
            config.wall_clock_cap(),
            config.review.safety_profile,
        );
        let budget = BudgetTracker::new(config.budgets.token_cap, config.wall_clock_cap());
        let workspace = GitWorkspace::open(project_dir)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e)))?;

        let review_config = ReviewLoopConfig::default()
            .with_max_builder_attempts(config.review.max_builder_attempts)
            .with_auditor_count(config.review.auditor_count)
            .with_context_token_budget(config.context.token_budget)
            .with_backoff_base(config.backoff_base());
        let selector = selector.with_min_excerpt_tokens(config.context.min_excerpt_tokens);
        let review = ReviewLoop::new(llm, Arc::new(selector), review_config);

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            config,
            run,
            graph,
            budget,
            journal: Arc::new(IncidentJournal::new()),
            review,
            workspace,
            events: EventBus::default(),
            cancel: CancelToken::default(),
        })
    }

    /// Share an existing journal so globally scoped prevention rules carry
    /// across runs.
    pub fn with_journal(mut self, journal: Arc<IncidentJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_state(&self) -> RunState {
        self.run.state
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.graph.get_index(id).and_then(|i| self.graph.get_phase(i))
    }

    pub fn phase_state(&self, id: &str) -> Option<PhaseState> {
        self.phase(id).map(|p| p.state.clone())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Transition the run from Created to Executing.
    pub fn start_run(&mut self) -> Result<(), OrchestratorError> {
        if self.run.state != RunState::Created {
            return Err(OrchestratorError::InvalidRunState {
                state: format!("{:?}", self.run.state),
            });
        }
        self.run.state = RunState::Executing;
        self.run.started_at = Some(Utc::now());
        self.events.emit(StateEvent::RunStarted { run_id: self.run.id });
        info!(run = %self.run.id, phases = self.graph.len(), "run started");
        Ok(())
    }

    /// One scheduling step: budget and cancellation checks, stale scan,
    /// then dispatch of the next eligible phase. Finalizes the run when no
    /// phase is dispatchable or a run-fatal condition is hit.
    pub async fn advance(&mut self) -> Result<AdvanceOutcome, OrchestratorError> {
        if self.run.state != RunState::Executing {
            return Err(OrchestratorError::InvalidRunState {
                state: format!("{:?}", self.run.state),
            });
        }

        if self.cancel.is_cancelled() {
            self.finalize_failed("run cancelled");
            return Ok(AdvanceOutcome::Finished);
        }
        if let Some(err) = self.budget.exhaustion() {
            self.journal.log(Incident::new(
                self.run.id,
                None,
                IncidentCategory::BudgetExhausted,
                &err.to_string(),
            ));
            self.finalize_failed(&err.to_string());
            return Ok(AdvanceOutcome::Finished);
        }

        self.reap_stale(Utc::now());

        let Some(index) = self.next_dispatchable() else {
            self.finalize();
            return Ok(AdvanceOutcome::Finished);
        };

        match self.dispatch(index).await {
            Ok(DispatchResult::Completed) => Ok(AdvanceOutcome::Dispatched),
            Ok(DispatchResult::PhaseFailed) => {
                if self.run.safety_profile.halt_on_phase_failure() {
                    let id = self.graph.get_phase(index).map(|p| p.id.clone());
                    self.finalize_failed(&format!(
                        "halted after phase {} failed (conservative profile)",
                        id.as_deref().unwrap_or("?")
                    ));
                    return Ok(AdvanceOutcome::Finished);
                }
                self.strand_dependents(index);
                Ok(AdvanceOutcome::Dispatched)
            }
            Err(OrchestratorError::Budget(err)) => {
                self.journal.log(Incident::new(
                    self.run.id,
                    None,
                    IncidentCategory::BudgetExhausted,
                    &err.to_string(),
                ));
                self.finalize_failed(&err.to_string());
                Ok(AdvanceOutcome::Finished)
            }
            Err(err) => Err(err),
        }
    }

    /// Drive the run to a terminal state and return its report.
    pub async fn execute(&mut self) -> Result<RunReport, OrchestratorError> {
        self.start_run()?;
        while self.advance().await? != AdvanceOutcome::Finished {}
        Ok(self.report())
    }

    /// Detect executing phases whose heartbeat went silent, reset them to
    /// Queued, or fail them once the reset budget is exhausted.
    pub fn reap_stale(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.stale_timeout();
        let max_resets = self.config.scheduling.max_stale_resets;
        let run_id = self.run.id;

        for index in 0..self.graph.len() {
            let stale = self
                .graph
                .get_phase(index)
                .map(|p| p.is_stale(now, timeout))
                .unwrap_or(false);
            if !stale {
                continue;
            }

            let (phase_id, resets) = {
                let phase = self.graph.get_phase_mut(index).expect("index in range");
                phase.state = PhaseState::Blocked;
                phase.stale_resets += 1;
                (phase.id.clone(), phase.stale_resets)
            };
            self.events.emit(StateEvent::PhaseTransition {
                run_id,
                phase_id: phase_id.clone(),
                state: PhaseState::Blocked,
            });
            let incident_id = self.journal.log(Incident::new(
                run_id,
                Some(&phase_id),
                IncidentCategory::StalePhase,
                &format!("heartbeat silent for over {:?}", timeout),
            ));

            if resets <= max_resets {
                warn!(phase = %phase_id, resets, "stale phase reset to queued");
                self.journal.resolve(
                    incident_id,
                    "reset to queued",
                    "Abort and re-dispatch attempts that stop reporting progress",
                );
                self.set_phase_state(index, PhaseState::Queued);
            } else {
                warn!(phase = %phase_id, resets, "stale reset budget exhausted; failing phase");
                self.set_phase_state(
                    index,
                    PhaseState::Failed {
                        reason: format!("stale after {} resets", resets - 1),
                    },
                );
            }
        }
    }

    /// The first queued phase, in declared order, whose dependencies are
    /// all Complete and whose scope is disjoint from every executing
    /// phase.
    fn next_dispatchable(&self) -> Option<PhaseIndex> {
        let completed: HashSet<PhaseIndex> = (0..self.graph.len())
            .filter(|&i| {
                self.graph
                    .get_phase(i)
                    .map(|p| p.state.is_complete())
                    .unwrap_or(false)
            })
            .collect();

        let executing_scopes: Vec<ScopeSet> = self
            .graph
            .phases()
            .iter()
            .filter(|p| p.state.is_executing())
            .filter_map(|p| ScopeSet::from_globs(&p.scope).ok())
            .collect();

        self.graph.phases().iter().enumerate().find_map(|(i, phase)| {
            if phase.state != PhaseState::Queued {
                return None;
            }
            if !self.graph.dependencies_satisfied(i, &completed) {
                return None;
            }
            let scope = ScopeSet::from_globs(&phase.scope).ok()?;
            if executing_scopes.iter().any(|s| s.overlaps(&scope)) {
                return None;
            }
            Some(i)
        })
    }

    /// Execute one phase through the review loop.
    async fn dispatch(&mut self, index: PhaseIndex) -> Result<DispatchResult, OrchestratorError> {
        {
            let phase = self
                .graph
                .get_phase(index)
                .ok_or_else(|| OrchestratorError::UnknownPhase {
                    phase: index.to_string(),
                })?;
            if phase.state != PhaseState::Queued {
                return Err(OrchestratorError::PhaseAlreadyExecuting {
                    phase: phase.id.clone(),
                });
            }
        }
        self.set_phase_state(index, PhaseState::Executing);
        let phase_id = {
            let phase = self.graph.get_phase_mut(index).expect("index in range");
            phase.beat();
            phase.id.clone()
        };

        self.workspace
            .snapshot_before(&phase_id)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e)))?;
        let snapshot = RepoSnapshot::capture(&self.project_dir)
            .map_err(OrchestratorError::Other)?;

        let outcome = {
            let phase = self.graph.get_phase_mut(index).expect("index in range");
            self.review
                .execute_phase(
                    &self.run,
                    phase,
                    &snapshot,
                    &self.budget,
                    &self.journal,
                    &self.workspace,
                )
                .await?
        };
        self.run.tokens_used = self.budget.tokens_used();

        match outcome {
            ReviewOutcome::Applied { commit, attempts } => {
                info!(phase = %phase_id, %commit, attempts, "phase complete");
                self.set_phase_state(index, PhaseState::Complete);
                Ok(DispatchResult::Completed)
            }
            ReviewOutcome::Failed { category, reason } => {
                warn!(phase = %phase_id, ?category, %reason, "phase failed");
                self.set_phase_state(index, PhaseState::Failed { reason });
                Ok(DispatchResult::PhaseFailed)
            }
        }
    }

    /// Fail every non-terminal transitive dependent of a failed phase.
    /// Independent phases keep running.
    fn strand_dependents(&mut self, failed: PhaseIndex) {
        let failed_id = self
            .graph
            .get_phase(failed)
            .map(|p| p.id.clone())
            .unwrap_or_default();
        for index in self.graph.transitive_dependents(failed) {
            let stranded = self
                .graph
                .get_phase(index)
                .map(|p| !p.state.is_terminal())
                .unwrap_or(false);
            if stranded {
                self.set_phase_state(
                    index,
                    PhaseState::Failed {
                        reason: format!("dependency {} failed", failed_id),
                    },
                );
            }
        }
    }

    fn set_phase_state(&mut self, index: PhaseIndex, state: PhaseState) {
        let phase_id = {
            let phase = self.graph.get_phase_mut(index).expect("index in range");
            phase.state = state.clone();
            phase.id.clone()
        };
        self.events.emit(StateEvent::PhaseTransition {
            run_id: self.run.id,
            phase_id,
            state,
        });
    }

    /// Settle the run once no phase is dispatchable.
    fn finalize(&mut self) {
        let all_complete = self.graph.phases().iter().all(|p| p.state.is_complete());
        let any_complete = self.graph.phases().iter().any(|p| p.state.is_complete());

        self.run.state = if all_complete {
            RunState::DoneSuccess
        } else if any_complete {
            RunState::DonePartial
        } else {
            RunState::Failed
        };
        if self.run.state != RunState::DoneSuccess {
            self.run.failure_reason = Some(self.report().summary());
        }
        self.seal();
    }

    fn finalize_failed(&mut self, reason: &str) {
        warn!(run = %self.run.id, reason, "run failed");
        self.run.state = RunState::Failed;
        self.run.failure_reason = Some(reason.to_string());
        self.seal();
    }

    fn seal(&mut self) {
        self.run.completed_at = Some(Utc::now());
        self.run.tokens_used = self.budget.tokens_used();
        self.events.emit(StateEvent::RunFinished {
            run_id: self.run.id,
            state: self.run.state,
        });
        info!(run = %self.run.id, state = ?self.run.state, tokens = self.run.tokens_used, "run finished");
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run: self.run.clone(),
            phases: self.graph.phases().to_vec(),
            incidents: self.journal.entries(),
        }
    }

    #[cfg(test)]
    pub(crate) fn phase_mut_for_test(&mut self, id: &str) -> &mut Phase {
        let index = self.graph.get_index(id).unwrap();
        self.graph.get_phase_mut(index).unwrap()
    }
}
