//! Token and wall-clock budget accounting.
//!
//! The tracker is the single point of truth for spend: counters are atomic
//! increment-and-check, and callers never cache remaining budget. A charge
//! is reserved *before* the blocking LLM call begins and reconciled with
//! actual usage afterwards, so many in-flight calls cannot overshoot the
//! cap by more than the largest single call's actual usage.
//!
//! Crossing 75/85/95% of the token cap produces warning signals for the
//! incident journal; 100% is the only hard stop.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::BudgetError;

/// Warning thresholds as percent of token cap.
const WARN_THRESHOLDS: [u8; 3] = [75, 85, 95];

/// A non-fatal threshold crossing, reported once per threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetWarning {
    pub percent: u8,
    pub used: u64,
    pub cap: u64,
}

/// Result of a charge: the post-charge total, whether it remains within
/// cap, and any thresholds newly crossed by this charge.
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub within_cap: bool,
    pub total_used: u64,
    pub warnings: Vec<BudgetWarning>,
}

/// A pre-authorized token estimate for one in-flight LLM call. Must be
/// reconciled with actual usage after the call returns.
#[derive(Debug)]
#[must_use = "reservations must be reconciled with actual usage"]
pub struct Reservation {
    estimate: u64,
}

impl Reservation {
    pub fn estimate(&self) -> u64 {
        self.estimate
    }
}

/// Per-run budget tracker.
#[derive(Debug)]
pub struct BudgetTracker {
    token_cap: u64,
    wall_clock_cap: Duration,
    tokens_used: AtomicU64,
    started: Instant,
    /// Bitmask of WARN_THRESHOLDS indices already reported.
    warned: AtomicU8,
}

impl BudgetTracker {
    pub fn new(token_cap: u64, wall_clock_cap: Duration) -> Self {
        Self {
            token_cap,
            wall_clock_cap,
            tokens_used: AtomicU64::new(0),
            started: Instant::now(),
            warned: AtomicU8::new(0),
        }
    }

    pub fn token_cap(&self) -> u64 {
        self.token_cap
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    /// Wall-clock time remaining before the cap. Zero once exceeded.
    pub fn time_remaining(&self) -> Duration {
        self.wall_clock_cap.saturating_sub(self.started.elapsed())
    }

    /// Hard-stop check: token cap reached or wall clock expired.
    pub fn is_exhausted(&self) -> bool {
        self.tokens_used() >= self.token_cap || self.time_remaining().is_zero()
    }

    /// The exhaustion reason, if exhausted.
    pub fn exhaustion(&self) -> Option<BudgetError> {
        let used = self.tokens_used();
        if used >= self.token_cap {
            return Some(BudgetError::TokensExhausted {
                used,
                cap: self.token_cap,
            });
        }
        if self.time_remaining().is_zero() {
            return Some(BudgetError::WallClockExhausted {
                elapsed_secs: self.started.elapsed().as_secs(),
                cap_secs: self.wall_clock_cap.as_secs(),
            });
        }
        None
    }

    /// Atomically add `tokens` and report whether the post-charge total
    /// remains within cap. Going over cap is permitted for the in-flight
    /// call that caused it; subsequent reservations are refused.
    pub fn charge(&self, tokens: u64) -> ChargeOutcome {
        let total = self.tokens_used.fetch_add(tokens, Ordering::SeqCst) + tokens;
        let warnings = self.collect_warnings(total);
        for w in &warnings {
            warn!(percent = w.percent, used = w.used, cap = w.cap, "token budget threshold crossed");
        }
        ChargeOutcome {
            within_cap: total <= self.token_cap,
            total_used: total,
            warnings,
        }
    }

    /// Reserve an estimated charge before committing to an LLM call.
    /// Fails if the budget is already exhausted; otherwise the estimate is
    /// charged immediately so concurrent callers see it.
    pub fn reserve(&self, estimate: u64) -> Result<(Reservation, ChargeOutcome), BudgetError> {
        if let Some(err) = self.exhaustion() {
            return Err(err);
        }
        let outcome = self.charge(estimate);
        Ok((Reservation { estimate }, outcome))
    }

    /// Reconcile a reservation with the actual token usage reported by the
    /// call. Over-estimates are refunded; under-estimates are charged
    /// retroactively, which may push the tracker over cap. The overshoot
    /// is permitted for this call and blocks all subsequent ones.
    pub fn reconcile(&self, reservation: Reservation, actual: u64) -> ChargeOutcome {
        if actual >= reservation.estimate {
            self.charge(actual - reservation.estimate)
        } else {
            let refund = reservation.estimate - actual;
            let total = self.tokens_used.fetch_sub(refund, Ordering::SeqCst) - refund;
            ChargeOutcome {
                within_cap: total <= self.token_cap,
                total_used: total,
                warnings: Vec::new(),
            }
        }
    }

    /// Thresholds newly crossed at `total`, each reported exactly once.
    fn collect_warnings(&self, total: u64) -> Vec<BudgetWarning> {
        if self.token_cap == 0 {
            return Vec::new();
        }
        let percent = (total.saturating_mul(100)) / self.token_cap;
        let mut crossed = Vec::new();
        for (i, &threshold) in WARN_THRESHOLDS.iter().enumerate() {
            if percent >= u64::from(threshold) {
                let bit = 1u8 << i;
                let prev = self.warned.fetch_or(bit, Ordering::SeqCst);
                if prev & bit == 0 {
                    crossed.push(BudgetWarning {
                        percent: threshold,
                        used: total,
                        cap: self.token_cap,
                    });
                }
            }
        }
        crossed
    }
}
