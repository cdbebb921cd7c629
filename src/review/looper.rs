//! The builder/auditor review loop.
//!
//! One phase attempt: select context, call the builder with injected
//! prevention rules, validate the proposed patch, collect auditor
//! verdicts against the exact context the builder saw plus the diff,
//! reconcile, and hand approved patches to the governed applier.
//!
//! Retry is explicit state, not hidden control flow: attempt counters and
//! the last failure category live on the phase, and each subsequent
//! attempt derives a different strategy (regenerated context, shrunk
//! context, narrowed patch request) with the previous failure injected as
//! feedback, so a literal repeat of an identical request is impossible by
//! construction. Transient API failures back off exponentially without
//! consuming a builder attempt; content failures do consume one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::budget::{BudgetTracker, ChargeOutcome};
use crate::context::{ContextBundle, ContextSelector, RepoSnapshot};
use crate::errors::OrchestratorError;
use crate::journal::{Incident, IncidentCategory, IncidentJournal};
use crate::llm::{LlmClient, LlmRole};
use crate::patch::{parse_patch, GitWorkspace, ScopeSet};
use crate::review::{reconcile, AuditorVerdict, BuilderResult, BuilderStatus, ReviewDecision};
use crate::run::{Phase, Run};

/// Tuning knobs for the review loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewLoopConfig {
    /// Builder attempts per phase before the phase fails.
    pub max_builder_attempts: u32,
    /// Transient-error retries per LLM call.
    pub max_transient_retries: u32,
    /// Auditors consulted per candidate patch (1 or 2).
    pub auditor_count: u8,
    /// Token budget for context selection on a standard attempt.
    pub context_token_budget: u64,
    /// Base delay for exponential backoff on transient failures.
    #[serde(with = "crate::run::duration_serde")]
    pub backoff_base: Duration,
}

impl Default for ReviewLoopConfig {
    fn default() -> Self {
        Self {
            max_builder_attempts: 3,
            max_transient_retries: 3,
            auditor_count: 2,
            context_token_budget: 16_000,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl ReviewLoopConfig {
    pub fn with_max_builder_attempts(mut self, attempts: u32) -> Self {
        self.max_builder_attempts = attempts;
        self
    }

    pub fn with_auditor_count(mut self, count: u8) -> Self {
        self.auditor_count = count.clamp(1, 2);
        self
    }

    pub fn with_context_token_budget(mut self, tokens: u64) -> Self {
        self.context_token_budget = tokens;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

/// Per-attempt strategy. Changes whenever the previous attempt failed on
/// content, so consecutive failures of the same category never repeat the
/// identical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptStrategy {
    Standard,
    /// Half the context budget; forces the builder to focus.
    ShrunkContext,
    /// Quarter budget plus an explicit instruction to produce the smallest
    /// possible patch.
    NarrowPatch,
}

impl AttemptStrategy {
    fn for_attempt(attempt: u32) -> Self {
        match attempt {
            1 => Self::Standard,
            2 => Self::ShrunkContext,
            _ => Self::NarrowPatch,
        }
    }

    fn context_budget(self, base: u64) -> u64 {
        let budget = match self {
            Self::Standard => base,
            Self::ShrunkContext => base / 2,
            Self::NarrowPatch => base / 4,
        };
        budget.max(256)
    }

    fn instruction(self) -> Option<&'static str> {
        match self {
            Self::Standard => None,
            Self::ShrunkContext => {
                Some("Context has been reduced; change only what the task strictly requires.")
            }
            Self::NarrowPatch => {
                Some("Produce the smallest possible patch that satisfies the task; touch as few files and lines as you can.")
            }
        }
    }
}

/// Terminal result of executing one phase through the loop.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    /// Patch approved and committed.
    Applied { commit: String, attempts: u32 },
    /// Attempts exhausted; the phase fails with its dominant category.
    Failed {
        category: IncidentCategory,
        reason: String,
    },
}

/// Content categories whose prevention rules get injected into prompts.
const RULE_CATEGORIES: [IncidentCategory; 4] = [
    IncidentCategory::MalformedPatch,
    IncidentCategory::ScopeViolation,
    IncidentCategory::BuilderFailure,
    IncidentCategory::AuditorRejection,
];

pub struct ReviewLoop {
    llm: Arc<dyn LlmClient>,
    selector: Arc<ContextSelector>,
    config: ReviewLoopConfig,
}

impl ReviewLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        selector: Arc<ContextSelector>,
        config: ReviewLoopConfig,
    ) -> Self {
        Self {
            llm,
            selector,
            config,
        }
    }

    #[cfg(test)]
    pub(crate) fn context_selector(&self) -> &ContextSelector {
        &self.selector
    }

    /// Drive one phase to a terminal outcome.
    ///
    /// Budget exhaustion propagates as an error (fatal to the run);
    /// everything else resolves to a `ReviewOutcome`.
    pub async fn execute_phase(
        &self,
        run: &Run,
        phase: &mut Phase,
        snapshot: &RepoSnapshot,
        budget: &BudgetTracker,
        journal: &IncidentJournal,
        workspace: &GitWorkspace,
    ) -> Result<ReviewOutcome, OrchestratorError> {
        let scope = ScopeSet::from_globs(&phase.scope)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e)))?;

        let mut feedback: Option<String> = None;

        for attempt in 1..=self.config.max_builder_attempts {
            phase.builder_attempts += 1;
            phase.beat();

            let strategy = AttemptStrategy::for_attempt(attempt);
            let bundle = self
                .selector
                .select(
                    phase,
                    snapshot,
                    strategy.context_budget(self.config.context_token_budget),
                )
                .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e)))?;

            let rules = self.gather_rules(journal, run);
            let builder_prompt =
                builder_prompt(phase, &bundle, &rules, strategy, feedback.as_deref());

            let Some(response) = self
                .call_with_backoff(LlmRole::Builder, &builder_prompt, &bundle, run, phase, budget, journal)
                .await?
            else {
                return Ok(ReviewOutcome::Failed {
                    category: IncidentCategory::Transient,
                    reason: "builder call failed after transient retries".into(),
                });
            };
            phase.beat();

            let builder = match parse_builder_result(&response.text) {
                Ok(result) => result,
                Err(reason) => {
                    self.record_content_failure(
                        run,
                        phase,
                        journal,
                        IncidentCategory::BuilderFailure,
                        &format!("unparseable builder output: {}", reason),
                        "Respond with exactly one JSON object matching the builder output contract",
                    );
                    feedback = Some(format!("Your previous response did not parse: {}", reason));
                    continue;
                }
            };

            let patch_text = match (builder.status, builder.patch) {
                (BuilderStatus::Proposed, Some(patch)) => patch,
                (status, _) => {
                    let symptom = format!(
                        "builder returned status {:?} without a usable patch: {}",
                        status, builder.rationale
                    );
                    self.record_content_failure(
                        run,
                        phase,
                        journal,
                        IncidentCategory::BuilderFailure,
                        &symptom,
                        "Always attach a complete unified diff when proposing a change",
                    );
                    feedback = Some(symptom);
                    continue;
                }
            };

            let parsed = match parse_patch(&patch_text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.record_content_failure(
                        run,
                        phase,
                        journal,
                        IncidentCategory::MalformedPatch,
                        &err.to_string(),
                        "Emit complete unified diffs; never elide content with ellipses or placeholders",
                    );
                    feedback = Some(format!(
                        "Your patch was rejected before application: {}. Regenerate the full diff.",
                        err
                    ));
                    continue;
                }
            };

            if let Some(outside) = parsed.touched_paths().find(|p| !scope.permits(p)) {
                let symptom = format!("patch touched out-of-scope path {}", outside.display());
                self.record_content_failure(
                    run,
                    phase,
                    journal,
                    IncidentCategory::ScopeViolation,
                    &symptom,
                    &format!("Only modify files matching: {}", phase.scope.join(", ")),
                );
                feedback = Some(format!(
                    "{}. Allowed scope: {}",
                    symptom,
                    phase.scope.join(", ")
                ));
                continue;
            }

            // Auditors see exactly the builder's context plus the diff.
            let auditor_prompt = auditor_prompt(phase, &bundle, &patch_text, &rules);
            let mut verdicts: Vec<AuditorVerdict> = Vec::new();
            let mut auditor_failed_transiently = false;
            for _ in 0..self.config.auditor_count {
                phase.auditor_rounds += 1;
                let Some(response) = self
                    .call_with_backoff(LlmRole::Auditor, &auditor_prompt, &bundle, run, phase, budget, journal)
                    .await?
                else {
                    auditor_failed_transiently = true;
                    break;
                };
                phase.beat();
                match parse_auditor_verdict(&response.text) {
                    Ok(verdict) => verdicts.push(verdict),
                    Err(reason) => {
                        // An unreadable auditor cannot approve anything.
                        warn!(phase = %phase.id, reason, "auditor output unparseable; counting as reject");
                        verdicts.push(AuditorVerdict {
                            verdict: crate::review::Verdict::Reject,
                            findings: Vec::new(),
                            confidence: 0.0,
                        });
                    }
                }
            }
            if auditor_failed_transiently {
                return Ok(ReviewOutcome::Failed {
                    category: IncidentCategory::Transient,
                    reason: "auditor call failed after transient retries".into(),
                });
            }

            match reconcile(&verdicts, run.safety_profile) {
                ReviewDecision::Approved => {
                    match workspace.apply(&parsed, &scope, &phase.id) {
                        Ok(applied) => {
                            phase.last_failure = None;
                            info!(phase = %phase.id, commit = %applied.commit, attempt, "phase patch approved and applied");
                            return Ok(ReviewOutcome::Applied {
                                commit: applied.commit,
                                attempts: attempt,
                            });
                        }
                        Err(err) if err.is_scope_violation() => {
                            self.record_content_failure(
                                run,
                                phase,
                                journal,
                                IncidentCategory::ScopeViolation,
                                &err.to_string(),
                                &format!("Only modify files matching: {}", phase.scope.join(", ")),
                            );
                            feedback = Some(err.to_string());
                            continue;
                        }
                        Err(err) => {
                            self.record_content_failure(
                                run,
                                phase,
                                journal,
                                IncidentCategory::MalformedPatch,
                                &err.to_string(),
                                "Generate patches against the current file contents, with accurate context lines",
                            );
                            feedback = Some(format!(
                                "Your patch did not apply cleanly: {}. Regenerate against current file contents.",
                                err
                            ));
                            continue;
                        }
                    }
                }
                ReviewDecision::Rejected { reason } => {
                    let findings: Vec<String> = verdicts
                        .iter()
                        .flat_map(|v| v.findings.iter())
                        .map(|f| format!("[{:?}] {}", f.severity, f.message))
                        .collect();
                    let symptom = if findings.is_empty() {
                        reason.clone()
                    } else {
                        format!("{}; findings: {}", reason, findings.join("; "))
                    };
                    self.record_content_failure(
                        run,
                        phase,
                        journal,
                        IncidentCategory::AuditorRejection,
                        &symptom,
                        "Address every auditor finding before resubmitting a patch",
                    );
                    feedback = Some(format!("Auditors rejected the previous patch: {}", symptom));
                    continue;
                }
            }
        }

        let category = phase.last_failure.unwrap_or(IncidentCategory::BuilderFailure);
        Ok(ReviewOutcome::Failed {
            category,
            reason: format!(
                "builder attempts exhausted ({} of {})",
                phase.builder_attempts, self.config.max_builder_attempts
            ),
        })
    }

    /// All prevention rules visible to this run across content categories,
    /// deduplicated in accumulation order.
    fn gather_rules(&self, journal: &IncidentJournal, run: &Run) -> Vec<String> {
        let mut rules = Vec::new();
        for category in RULE_CATEGORIES {
            for rule in journal.prevention_rules_for(category, run.id) {
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
        }
        rules
    }

    /// Log a content failure as an incident, resolve it with the canned
    /// prevention rule, and record the category on the phase for
    /// strategy-change decisions.
    fn record_content_failure(
        &self,
        run: &Run,
        phase: &mut Phase,
        journal: &IncidentJournal,
        category: IncidentCategory,
        symptom: &str,
        prevention_rule: &str,
    ) {
        let id = journal.log(Incident::new(run.id, Some(&phase.id), category, symptom));
        journal.resolve(id, "retried with changed strategy", prevention_rule);
        phase.last_failure = Some(category);
    }

    /// One LLM call with budget reservation before the suspension point
    /// and exponential backoff on transient failures. `None` means the
    /// call never succeeded within the retry budget.
    #[allow(clippy::too_many_arguments)]
    async fn call_with_backoff(
        &self,
        role: LlmRole,
        prompt: &str,
        bundle: &ContextBundle,
        run: &Run,
        phase: &Phase,
        budget: &BudgetTracker,
        journal: &IncidentJournal,
    ) -> Result<Option<crate::llm::LlmResponse>, OrchestratorError> {
        for retry in 0..=self.config.max_transient_retries {
            let estimate = self.llm.estimate_tokens(prompt, bundle);
            let (reservation, outcome) = budget
                .reserve(estimate)
                .map_err(OrchestratorError::Budget)?;
            self.journal_budget_warnings(&outcome, run, phase, journal);

            match self.llm.call(role, prompt, bundle).await {
                Ok(response) => {
                    let outcome = budget.reconcile(reservation, response.tokens_used);
                    self.journal_budget_warnings(&outcome, run, phase, journal);
                    return Ok(Some(response));
                }
                Err(err) => {
                    // Usage of a failed call is unknown; release the estimate.
                    budget.reconcile(reservation, 0);
                    journal.log(Incident::new(
                        run.id,
                        Some(&phase.id),
                        IncidentCategory::Transient,
                        &format!("{:?} call failed: {}", role, err),
                    ));
                    if err.is_transient() && retry < self.config.max_transient_retries {
                        let delay = self.config.backoff_base * 2u32.saturating_pow(retry);
                        debug!(?role, retry, delay_ms = delay.as_millis() as u64, "transient LLM failure; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn journal_budget_warnings(
        &self,
        outcome: &ChargeOutcome,
        run: &Run,
        phase: &Phase,
        journal: &IncidentJournal,
    ) {
        for warning in &outcome.warnings {
            journal.log(Incident::new(
                run.id,
                Some(&phase.id),
                IncidentCategory::BudgetWarning,
                &format!(
                    "token budget {}% threshold crossed ({} of {})",
                    warning.percent, warning.used, warning.cap
                ),
            ));
        }
    }
}

/// Assemble the builder prompt: task, scope, context, accumulated
/// prevention rules, feedback from the previous attempt, and the output
/// contract.
fn builder_prompt(
    phase: &Phase,
    bundle: &ContextBundle,
    rules: &[String],
    strategy: AttemptStrategy,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are the builder for phase {} - {}.\n\n## TASK\n{}\n\n## FILE SCOPE\nYou may only modify files matching: {}\n\n## REPOSITORY CONTEXT\n{}",
        phase.id,
        phase.name,
        phase.description,
        phase.scope.join(", "),
        bundle.render()
    );

    if !rules.is_empty() {
        prompt.push_str("\n## PREVENTION RULES\n");
        for rule in rules {
            prompt.push_str(&format!("- {}\n", rule));
        }
    }

    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\n## PREVIOUS ATTEMPT FEEDBACK\n{}\n", feedback));
    }

    if let Some(instruction) = strategy.instruction() {
        prompt.push_str(&format!("\n## STRATEGY\n{}\n", instruction));
    }

    prompt.push_str(
        "\n## OUTPUT CONTRACT\nRespond with a single JSON object: \
        {\"status\": \"proposed\"|\"needs_clarification\"|\"failed\", \
        \"patch\": \"<unified diff>\"|null, \"rationale\": \"...\", \
        \"self_reported_issues\": [\"...\"]}\n",
    );
    prompt
}

/// Assemble the auditor prompt: identical context to the builder, plus
/// the candidate patch.
fn auditor_prompt(phase: &Phase, bundle: &ContextBundle, patch: &str, rules: &[String]) -> String {
    let mut prompt = format!(
        "You are an auditor reviewing a candidate patch for phase {} - {}.\n\n## TASK\n{}\n\n## REPOSITORY CONTEXT\n{}\n## CANDIDATE PATCH\n```diff\n{}\n```\n",
        phase.id,
        phase.name,
        phase.description,
        bundle.render(),
        patch
    );

    if !rules.is_empty() {
        prompt.push_str("\n## PREVENTION RULES\n");
        for rule in rules {
            prompt.push_str(&format!("- {}\n", rule));
        }
    }

    prompt.push_str(
        "\n## OUTPUT CONTRACT\nRespond with a single JSON object: \
        {\"verdict\": \"approve\"|\"reject\"|\"request_changes\", \
        \"findings\": [{\"severity\": \"minor\"|\"major\", \"message\": \"...\", \"path\": null}], \
        \"confidence\": 0.0}\n",
    );
    prompt
}

/// Extract the outermost JSON object from model output.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_builder_result(text: &str) -> Result<BuilderResult, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(json).map_err(|e| e.to_string())
}

fn parse_auditor_verdict(text: &str) -> Result<AuditorVerdict, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(json).map_err(|e| e.to_string())
}
