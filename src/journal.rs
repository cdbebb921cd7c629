//! Append-only incident journal with prevention-rule accumulation.
//!
//! Every failure the engine observes is logged as an `Incident`. When an
//! incident is resolved, a short imperative prevention rule is derived and
//! stored with it. The review loop injects the accumulated rules for an
//! error category verbatim into subsequent builder/auditor prompts, which is
//! the mechanism that stops the same class of error from recurring.
//! Without it, every phase forgets what the previous phase learned.
//!
//! Entries are never deleted, only marked resolved. The journal is an
//! explicit value passed into each review-loop invocation rather than
//! ambient global state; sharing across runs is opt-in via rule scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Classification of a failure, used both for retry policy and as the key
/// for prevention-rule lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCategory {
    /// LLM API timeout or rate limit. Retried with backoff, never surfaced
    /// as a run failure unless retries exhaust.
    Transient,
    /// Unparseable or incomplete patch text.
    MalformedPatch,
    /// Patch touched a path outside the phase's declared scope.
    ScopeViolation,
    /// Builder reported failure or produced no patch.
    BuilderFailure,
    /// Auditors rejected the patch on content grounds.
    AuditorRejection,
    /// Executing phase lost its heartbeat and was reset.
    StalePhase,
    /// Budget threshold crossing (75/85/95%). Observability only.
    BudgetWarning,
    /// Token or wall-clock cap breached. The run stops.
    BudgetExhausted,
}

impl IncidentCategory {
    /// Transient failures keep the same strategy and back off; everything
    /// else is a content failure that must change strategy on repeat.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Visibility scope of a prevention rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Applies only within the originating run.
    Run(Uuid),
    /// Applies to every run sharing this journal.
    Global,
}

/// One recorded failure, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub phase_id: Option<String>,
    pub category: IncidentCategory,
    pub symptom: String,
    pub resolution: Option<String>,
    pub prevention_rule: Option<String>,
    pub rule_scope: RuleScope,
}

impl Incident {
    pub fn new(
        run_id: Uuid,
        phase_id: Option<&str>,
        category: IncidentCategory,
        symptom: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            phase_id: phase_id.map(String::from),
            category,
            symptom: symptom.to_string(),
            resolution: None,
            prevention_rule: None,
            rule_scope: RuleScope::Run(run_id),
        }
    }

    /// Promote the eventual prevention rule to global scope.
    pub fn with_global_scope(mut self) -> Self {
        self.rule_scope = RuleScope::Global;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Append-only incident log. Interior mutability behind a mutex so the
/// journal can be shared by reference across the orchestrator and review
/// loop; appends are the only mutation.
#[derive(Debug, Default)]
pub struct IncidentJournal {
    entries: Mutex<Vec<Incident>>,
}

impl IncidentJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incident, returning its id.
    pub fn log(&self, incident: Incident) -> Uuid {
        let id = incident.id;
        info!(
            category = ?incident.category,
            phase = incident.phase_id.as_deref().unwrap_or("-"),
            symptom = %incident.symptom,
            "incident logged"
        );
        self.entries
            .lock()
            .expect("journal mutex poisoned")
            .push(incident);
        id
    }

    /// Mark an incident resolved and attach its derived prevention rule.
    /// Unknown ids are ignored; the journal never fails an append-side
    /// caller over bookkeeping.
    pub fn resolve(&self, incident_id: Uuid, resolution: &str, prevention_rule: &str) {
        let mut entries = self.entries.lock().expect("journal mutex poisoned");
        if let Some(incident) = entries.iter_mut().find(|i| i.id == incident_id) {
            incident.resolution = Some(resolution.to_string());
            incident.prevention_rule = Some(prevention_rule.to_string());
        }
    }

    /// Prevention rules for a category, visible to the given run: rules
    /// scoped to that run plus globally scoped rules. Order of accumulation
    /// is preserved (append order).
    pub fn prevention_rules_for(&self, category: IncidentCategory, run_id: Uuid) -> Vec<String> {
        let entries = self.entries.lock().expect("journal mutex poisoned");
        entries
            .iter()
            .filter(|i| i.category == category)
            .filter(|i| match &i.rule_scope {
                RuleScope::Run(id) => *id == run_id,
                RuleScope::Global => true,
            })
            .filter_map(|i| i.prevention_rule.clone())
            .collect()
    }

    /// Count of incidents for a (run, phase, category) triple. Used by the
    /// review loop to detect repeated failures of the same category.
    pub fn count_for_phase(
        &self,
        run_id: Uuid,
        phase_id: &str,
        category: IncidentCategory,
    ) -> usize {
        let entries = self.entries.lock().expect("journal mutex poisoned");
        entries
            .iter()
            .filter(|i| {
                i.run_id == run_id
                    && i.phase_id.as_deref() == Some(phase_id)
                    && i.category == category
            })
            .count()
    }

    /// The most recent incident for a run, if any. Used in run-level
    /// failure reports.
    pub fn last_for_run(&self, run_id: Uuid) -> Option<Incident> {
        let entries = self.entries.lock().expect("journal mutex poisoned");
        entries.iter().rev().find(|i| i.run_id == run_id).cloned()
    }

    /// Snapshot of all entries, for audit persistence.
    pub fn entries(&self) -> Vec<Incident> {
        self.entries.lock().expect("journal mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("journal mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
