//! Builder/auditor review types and verdict reconciliation.
//!
//! The builder proposes, auditors dispose. Verdicts from multiple auditors
//! are reconciled conservatively: both must approve, any major finding
//! auto-rejects, and a split verdict is a reject; the safety profile
//! favors false rejection over false acceptance. Disagreement is a signal
//! recorded in the rejection reason, never silently dropped.

pub mod looper;

pub use looper::{ReviewLoop, ReviewLoopConfig, ReviewOutcome};

use serde::{Deserialize, Serialize};

use crate::run::SafetyProfile;

/// Builder call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderStatus {
    /// A candidate patch is attached.
    Proposed,
    /// The builder could not proceed without more information.
    NeedsClarification,
    /// The builder failed outright.
    Failed,
}

/// Parsed output of one builder call. Ephemeral, consumed by the review
/// loop, persisted only through the incident journal on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderResult {
    pub status: BuilderStatus,
    /// Unified diff text, when status is Proposed.
    pub patch: Option<String>,
    pub rationale: String,
    #[serde(default)]
    pub self_reported_issues: Vec<String>,
}

/// Severity of one auditor finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Minor,
    Major,
}

/// One issue identified by an auditor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub message: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// An auditor's overall position on a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    RequestChanges,
}

/// Parsed output of one auditor call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorVerdict {
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Self-reported confidence in [0, 1].
    pub confidence: f32,
}

impl AuditorVerdict {
    pub fn major_findings(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Major)
            .count()
    }

    pub fn minor_findings(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Minor)
            .count()
    }
}

/// Result of reconciling all auditor verdicts for one patch.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Approved,
    Rejected { reason: String },
}

impl ReviewDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Reconcile one or more auditor verdicts under a safety profile.
///
/// Single auditor: approve iff the verdict is Approve. Dual auditors:
/// both must approve; any major finding auto-rejects; a split verdict is
/// reject-and-retry, never majority-pass. The profile's minor-finding
/// tolerance applies to the combined finding count on otherwise-approved
/// patches.
pub fn reconcile(verdicts: &[AuditorVerdict], profile: SafetyProfile) -> ReviewDecision {
    if verdicts.is_empty() {
        return ReviewDecision::rejected("no auditor verdicts returned");
    }

    let major: usize = verdicts.iter().map(AuditorVerdict::major_findings).sum();
    if major > 0 {
        return ReviewDecision::rejected(format!("{} major finding(s) reported", major));
    }

    let approvals = verdicts
        .iter()
        .filter(|v| v.verdict == Verdict::Approve)
        .count();
    if approvals < verdicts.len() {
        let reason = if approvals == 0 {
            "all auditors rejected the patch".to_string()
        } else {
            // Split verdicts are a signal in their own right.
            format!(
                "split verdict: {} of {} auditors approved; treating as reject",
                approvals,
                verdicts.len()
            )
        };
        return ReviewDecision::rejected(reason);
    }

    let minor: usize = verdicts.iter().map(AuditorVerdict::minor_findings).sum();
    if let Some(tolerance) = profile.minor_finding_tolerance() {
        if minor > tolerance {
            return ReviewDecision::rejected(format!(
                "{} minor findings exceed the profile tolerance of {}",
                minor, tolerance
            ));
        }
    }

    ReviewDecision::Approved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(v: Verdict, findings: Vec<Finding>) -> AuditorVerdict {
        AuditorVerdict {
            verdict: v,
            findings,
            confidence: 0.9,
        }
    }

    fn minor(msg: &str) -> Finding {
        Finding {
            severity: FindingSeverity::Minor,
            message: msg.into(),
            path: None,
        }
    }

    fn major(msg: &str) -> Finding {
        Finding {
            severity: FindingSeverity::Major,
            message: msg.into(),
            path: None,
        }
    }

    #[test]
    fn test_single_auditor_approve() {
        let decision = reconcile(&[verdict(Verdict::Approve, vec![])], SafetyProfile::Standard);
        assert!(decision.is_approved());
    }

    #[test]
    fn test_single_auditor_reject() {
        let decision = reconcile(&[verdict(Verdict::Reject, vec![])], SafetyProfile::Standard);
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_dual_auditor_split_is_reject() {
        let decision = reconcile(
            &[
                verdict(Verdict::Approve, vec![]),
                verdict(Verdict::Reject, vec![]),
            ],
            SafetyProfile::Standard,
        );
        match decision {
            ReviewDecision::Rejected { reason } => assert!(reason.contains("split verdict")),
            ReviewDecision::Approved => panic!("split verdict must not approve"),
        }
    }

    #[test]
    fn test_major_finding_auto_rejects_even_with_approvals() {
        // One auditor approves, the other rejects with a major finding:
        // reject-and-retry, never auto-approve.
        let decision = reconcile(
            &[
                verdict(Verdict::Approve, vec![]),
                verdict(Verdict::Reject, vec![major("writes outside module boundary")]),
            ],
            SafetyProfile::Standard,
        );
        match decision {
            ReviewDecision::Rejected { reason } => assert!(reason.contains("major")),
            ReviewDecision::Approved => panic!("major finding must reject"),
        }
    }

    #[test]
    fn test_major_finding_rejects_even_on_approve_verdict() {
        let decision = reconcile(
            &[verdict(Verdict::Approve, vec![major("unsafe block")])],
            SafetyProfile::Permissive,
        );
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_minor_tolerance_by_profile() {
        let findings = vec![minor("naming"), minor("docs")];
        let verdicts = [verdict(Verdict::Approve, findings)];

        assert!(!reconcile(&verdicts, SafetyProfile::Conservative).is_approved());
        assert!(reconcile(&verdicts, SafetyProfile::Standard).is_approved());
        assert!(reconcile(&verdicts, SafetyProfile::Permissive).is_approved());
    }

    #[test]
    fn test_standard_tolerance_boundary() {
        let findings: Vec<Finding> = (0..4).map(|i| minor(&format!("nit {}", i))).collect();
        let verdicts = [verdict(Verdict::Approve, findings)];
        assert!(!reconcile(&verdicts, SafetyProfile::Standard).is_approved());
        assert!(reconcile(&verdicts, SafetyProfile::Permissive).is_approved());
    }

    #[test]
    fn test_request_changes_is_not_approval() {
        let decision = reconcile(
            &[
                verdict(Verdict::Approve, vec![]),
                verdict(Verdict::RequestChanges, vec![minor("rename")]),
            ],
            SafetyProfile::Standard,
        );
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_no_verdicts_rejects() {
        assert!(!reconcile(&[], SafetyProfile::Standard).is_approved());
    }
}
