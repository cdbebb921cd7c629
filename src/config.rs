//! Engine configuration, loadable from `foreman.toml`.
//!
//! Every knob has a serde-level default so a partial (or absent) config
//! file still yields a fully specified engine. Values arriving from the
//! embedding CLI or dashboard override the file via the `with_*` builders.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::run::SafetyProfile;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ForemanConfig {
    #[serde(default)]
    pub budgets: BudgetsSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
}

/// Default run budgets, overridable per run at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetsSection {
    /// Token cap per run.
    #[serde(default = "default_token_cap")]
    pub token_cap: u64,
    /// Wall-clock cap per run, in seconds.
    #[serde(default = "default_wall_clock_secs")]
    pub wall_clock_secs: u64,
}

fn default_token_cap() -> u64 {
    2_000_000
}

fn default_wall_clock_secs() -> u64 {
    4 * 3600
}

impl Default for BudgetsSection {
    fn default() -> Self {
        Self {
            token_cap: default_token_cap(),
            wall_clock_secs: default_wall_clock_secs(),
        }
    }
}

/// Builder/auditor loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewSection {
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    /// Builder attempts per phase before the phase fails.
    #[serde(default = "default_max_builder_attempts")]
    pub max_builder_attempts: u32,
    /// Transient-error retries per LLM call.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Auditors per candidate patch (1 or 2).
    #[serde(default = "default_auditor_count")]
    pub auditor_count: u8,
    /// Exponential backoff base for transient failures, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_builder_attempts() -> u32 {
    3
}

fn default_max_transient_retries() -> u32 {
    3
}

fn default_auditor_count() -> u8 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            safety_profile: SafetyProfile::default(),
            max_builder_attempts: default_max_builder_attempts(),
            max_transient_retries: default_max_transient_retries(),
            auditor_count: default_auditor_count(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

/// Context selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSection {
    /// Token budget for a standard-strategy context bundle.
    #[serde(default = "default_context_token_budget")]
    pub token_budget: u64,
    /// Minimum useful size for a truncated excerpt, in tokens.
    #[serde(default = "default_min_excerpt_tokens")]
    pub min_excerpt_tokens: u64,
}

fn default_context_token_budget() -> u64 {
    16_000
}

fn default_min_excerpt_tokens() -> u64 {
    32
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            token_budget: default_context_token_budget(),
            min_excerpt_tokens: default_min_excerpt_tokens(),
        }
    }
}

/// Orchestrator scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulingSection {
    /// Heartbeat silence before an executing phase is judged stale, in
    /// seconds.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Stale resets before a phase fails instead of re-queueing.
    #[serde(default = "default_max_stale_resets")]
    pub max_stale_resets: u32,
}

fn default_stale_timeout_secs() -> u64 {
    600
}

fn default_max_stale_resets() -> u32 {
    2
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            stale_timeout_secs: default_stale_timeout_secs(),
            max_stale_resets: default_max_stale_resets(),
        }
    }
}

impl ForemanConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load from `<dir>/foreman.toml`, or defaults if the file is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn with_safety_profile(mut self, profile: SafetyProfile) -> Self {
        self.review.safety_profile = profile;
        self
    }

    pub fn with_token_cap(mut self, cap: u64) -> Self {
        self.budgets.token_cap = cap;
        self
    }

    pub fn with_wall_clock_cap(mut self, cap: Duration) -> Self {
        self.budgets.wall_clock_secs = cap.as_secs();
        self
    }

    pub fn wall_clock_cap(&self) -> Duration {
        Duration::from_secs(self.budgets.wall_clock_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduling.stale_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.review.backoff_base_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_complete() {
        let config = ForemanConfig::default();
        assert_eq!(config.budgets.token_cap, 2_000_000);
        assert_eq!(config.review.safety_profile, SafetyProfile::Standard);
        assert_eq!(config.review.max_builder_attempts, 3);
        assert_eq!(config.review.auditor_count, 2);
        assert_eq!(config.context.token_budget, 16_000);
        assert_eq!(config.scheduling.stale_timeout_secs, 600);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ForemanConfig::parse(
            r#"
            [review]
            safety_profile = "conservative"
            auditor_count = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.review.safety_profile, SafetyProfile::Conservative);
        assert_eq!(config.review.auditor_count, 1);
        assert_eq!(config.review.max_builder_attempts, 3);
        assert_eq!(config.budgets.token_cap, 2_000_000);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = ForemanConfig::parse(
            r#"
            [budgets]
            token_cap = 100
            typo_field = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ForemanConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.budgets.token_cap, 2_000_000);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        let config = ForemanConfig::default()
            .with_safety_profile(SafetyProfile::Permissive)
            .with_token_cap(500_000);
        config.save(&path).unwrap();

        let loaded = ForemanConfig::load(&path).unwrap();
        assert_eq!(loaded.review.safety_profile, SafetyProfile::Permissive);
        assert_eq!(loaded.budgets.token_cap, 500_000);
    }

    #[test]
    fn test_duration_accessors() {
        let config = ForemanConfig::default().with_wall_clock_cap(Duration::from_secs(7200));
        assert_eq!(config.wall_clock_cap(), Duration::from_secs(7200));
        assert_eq!(config.stale_timeout(), Duration::from_secs(600));
        assert_eq!(config.backoff_base(), Duration::from_millis(500));
    }
}
