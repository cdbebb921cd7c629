//! File-scope allow-lists.
//!
//! Each phase declares the glob patterns it is permitted to touch. Every
//! path in a candidate patch must match at least one pattern; any path
//! outside scope rejects the whole patch. Scope sets also answer the
//! dispatch-time overlap question: phases whose scopes might write the
//! same files must serialize.

use glob::{MatchOptions, Pattern};
use std::path::Path;

use crate::errors::PatchError;

/// Compiled allow-list of glob patterns.
#[derive(Debug, Clone)]
pub struct ScopeSet {
    patterns: Vec<Pattern>,
    raw: Vec<String>,
}

impl ScopeSet {
    pub fn from_globs(globs: &[String]) -> Result<Self, PatchError> {
        let mut patterns = Vec::with_capacity(globs.len());
        for g in globs {
            let pattern = Pattern::new(g)
                .map_err(|e| anyhow::anyhow!("invalid scope glob '{}': {}", g, e))?;
            patterns.push(pattern);
        }
        Ok(Self {
            patterns,
            raw: globs.to_vec(),
        })
    }

    pub fn globs(&self) -> &[String] {
        &self.raw
    }

    /// Whether a repository-relative path is inside this scope.
    pub fn permits(&self, path: &Path) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_path_with(path, options))
    }

    /// Conservative overlap check between two scopes.
    ///
    /// Exact glob intersection is undecidable cheaply, so this
    /// over-approximates: two patterns overlap when the literal prefix of
    /// one (text before the first glob metacharacter) is a path-prefix of
    /// the other's, in either direction. False positives only serialize
    /// phases that could have run concurrently; false negatives would race
    /// writers, so the approximation errs toward overlap.
    pub fn overlaps(&self, other: &ScopeSet) -> bool {
        self.raw.iter().any(|a| {
            other.raw.iter().any(|b| {
                let ra = literal_root(a);
                let rb = literal_root(b);
                ra.starts_with(&rb) || rb.starts_with(&ra)
            })
        })
    }
}

/// Text of a glob up to its first metacharacter.
fn literal_root(pattern: &str) -> String {
    pattern
        .find(['*', '?', '['])
        .map(|i| &pattern[..i])
        .unwrap_or(pattern)
        .to_string()
}
