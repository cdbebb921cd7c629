//! Run and phase data model for the foreman engine.
//!
//! A `Run` is one end-to-end orchestrated build session composed of ordered
//! `Phase`s. The orchestrator owns the run exclusively; nothing else mutates
//! it. Phases carry their own retry history (attempt counters, stale resets,
//! last failure category) as explicit state rather than hidden loop
//! variables, which is what lets the stale-phase detector and the
//! strategy-change rule observe and act on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::journal::IncidentCategory;

/// Safety profile governing auto-approval thresholds and run continuation
/// after a phase failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    /// Reject on any finding, halt the run on first phase failure.
    Conservative,
    /// Tolerate a few minor findings, continue with independent phases.
    #[default]
    Standard,
    /// Tolerate minor findings freely, continue with independent phases.
    Permissive,
}

impl SafetyProfile {
    /// Whether a phase failure halts the whole run instead of continuing
    /// with phases that do not depend on the failed one.
    pub fn halt_on_phase_failure(&self) -> bool {
        matches!(self, Self::Conservative)
    }

    /// Maximum number of minor findings tolerated on an approved review.
    /// `None` means unlimited. Major findings always reject regardless.
    pub fn minor_finding_tolerance(&self) -> Option<usize> {
        match self {
            Self::Conservative => Some(0),
            Self::Standard => Some(3),
            Self::Permissive => None,
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    Executing,
    /// All phases completed.
    DoneSuccess,
    /// Some phases completed, some failed, run was allowed to continue.
    DonePartial,
    /// Run terminated without completing (budget exhaustion, halt-on-failure,
    /// cancellation).
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DoneSuccess | Self::DonePartial | Self::Failed)
    }
}

/// Lifecycle state of a phase.
///
/// Transitions: Queued → Executing → {Complete, Failed, Blocked → Queued}.
/// Blocked is the stale-recovery state: an executing phase whose heartbeat
/// went silent is marked Blocked and reset to Queued within the same
/// `advance()` cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Queued,
    Executing,
    Complete,
    Failed { reason: String },
    /// Stale attempt detected; transitional, reset to Queued immediately.
    Blocked,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Executing)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// One unit of work with a declared file scope, executed via the
/// builder/auditor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Phase identifier, unique within the run (e.g., "01", "schema").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Task description, used both in prompts and for context relevance
    /// scoring.
    pub description: String,
    /// Declared position in the run's phase order.
    pub position: usize,
    /// Category/complexity tags used for model routing.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Glob patterns for paths this phase is permitted to touch. Must be
    /// non-empty; validated at run creation.
    pub scope: Vec<String>,
    /// Phase ids that must be Complete before this phase is dispatchable.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current lifecycle state.
    #[serde(default)]
    pub state: PhaseState,
    /// Last heartbeat from an executing attempt.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Builder calls consumed so far across all attempts.
    #[serde(default)]
    pub builder_attempts: u32,
    /// Auditor rounds consumed so far across all attempts.
    #[serde(default)]
    pub auditor_rounds: u32,
    /// Times this phase was reset from a stale Executing state.
    #[serde(default)]
    pub stale_resets: u32,
    /// Category of the most recent failure, for strategy-change decisions.
    #[serde(default)]
    pub last_failure: Option<IncidentCategory>,
}

impl Phase {
    pub fn new(id: &str, name: &str, description: &str, scope: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            position: 0,
            tags: Vec::new(),
            scope,
            depends_on: Vec::new(),
            state: PhaseState::Queued,
            last_heartbeat: None,
            builder_attempts: 0,
            auditor_rounds: 0,
            stale_resets: 0,
            last_failure: None,
        }
    }

    /// Add dependencies on other phases.
    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Add routing tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Record a heartbeat for the in-flight attempt.
    pub fn beat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    /// Whether the phase has been Executing with no heartbeat newer than
    /// `timeout`. A phase with no heartbeat at all is judged against `now`
    /// having never beaten, which only happens if the attempt died before
    /// its first beat; it is treated as stale.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.state.is_executing() {
            return false;
        }
        match self.last_heartbeat {
            Some(beat) => {
                let age = now.signed_duration_since(beat);
                age.to_std().map(|a| a > timeout).unwrap_or(false)
            }
            None => true,
        }
    }
}

/// One end-to-end orchestrated build session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// Ordered phase ids.
    pub phase_order: Vec<String>,
    pub token_cap: u64,
    #[serde(with = "duration_serde")]
    pub wall_clock_cap: Duration,
    pub safety_profile: SafetyProfile,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Cumulative tokens charged, copied from the budget tracker at
    /// transition points.
    pub tokens_used: u64,
    /// Terminating reason for failed runs.
    pub failure_reason: Option<String>,
}

impl Run {
    pub fn new(
        phase_order: Vec<String>,
        token_cap: u64,
        wall_clock_cap: Duration,
        safety_profile: SafetyProfile,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase_order,
            token_cap,
            wall_clock_cap,
            safety_profile,
            state: RunState::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tokens_used: 0,
            failure_reason: None,
        }
    }
}

/// Serde helpers for Duration as whole milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
