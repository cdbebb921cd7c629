//! Deterministic, token-bounded context selection.
//!
//! Algorithm: score every snapshot file against the phase description via
//! the embedding backend, sort descending by score with deterministic
//! tie-breaking (most-recently-modified, then path lexical order), then
//! greedily include files until the next one would exceed the budget. A
//! single file larger than the remaining budget is truncated to its
//! highest query-term-overlap contiguous excerpt instead of being skipped,
//! unless the excerpt would fall below the minimum useful size.
//!
//! Identical (phase, snapshot, budget) inputs produce byte-identical
//! bundles, so builder and auditors within one attempt see the same
//! context.

use std::sync::Arc;
use tracing::debug;

use crate::context::{
    estimate_tokens, ContextBundle, ContextEntry, EmbeddingBackend, RepoSnapshot, SnapshotFile,
};
use crate::context::embedding::cosine_similarity;
use crate::errors::ContextError;
use crate::run::Phase;

/// Default floor below which a truncated excerpt is not worth including.
const DEFAULT_MIN_EXCERPT_TOKENS: u64 = 32;

pub struct ContextSelector {
    backend: Option<Arc<dyn EmbeddingBackend>>,
    min_excerpt_tokens: u64,
}

impl ContextSelector {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend: Some(backend),
            min_excerpt_tokens: DEFAULT_MIN_EXCERPT_TOKENS,
        }
    }

    /// A selector with no semantic backend. `select` fails closed.
    pub fn unconfigured() -> Self {
        Self {
            backend: None,
            min_excerpt_tokens: DEFAULT_MIN_EXCERPT_TOKENS,
        }
    }

    pub fn with_min_excerpt_tokens(mut self, tokens: u64) -> Self {
        self.min_excerpt_tokens = tokens;
        self
    }

    pub fn min_excerpt_tokens(&self) -> u64 {
        self.min_excerpt_tokens
    }

    /// Build a token-bounded bundle for one phase attempt.
    ///
    /// An empty snapshot yields an empty bundle; callers handle
    /// zero-context generation explicitly. A zero budget is an input error.
    pub fn select(
        &self,
        phase: &Phase,
        snapshot: &RepoSnapshot,
        token_budget: u64,
    ) -> Result<ContextBundle, ContextError> {
        if token_budget == 0 {
            return Err(ContextError::ZeroTokenBudget);
        }
        let Some(backend) = &self.backend else {
            return Err(ContextError::NoEmbeddingBackend);
        };
        if snapshot.is_empty() {
            return Ok(ContextBundle::default());
        }

        let query = backend.embed(&phase.description)?;
        let mut scored: Vec<(f32, &SnapshotFile)> = Vec::with_capacity(snapshot.files.len());
        for file in &snapshot.files {
            let embedding = backend.embed(&file.content)?;
            scored.push((cosine_similarity(&query, &embedding), file));
        }

        // Score desc, then mtime desc, then path asc. total_cmp keeps the
        // ordering total even for degenerate scores.
        scored.sort_by(|(sa, fa), (sb, fb)| {
            sb.total_cmp(sa)
                .then_with(|| fb.modified_ms.cmp(&fa.modified_ms))
                .then_with(|| fa.path.cmp(&fb.path))
        });

        let query_terms = query_terms(&phase.description);
        let mut entries = Vec::new();
        let mut used: u64 = 0;

        for (score, file) in scored {
            let remaining = token_budget - used;
            if remaining == 0 {
                break;
            }
            let full_tokens = estimate_tokens(&file.content);
            if full_tokens <= remaining {
                used += full_tokens;
                entries.push(ContextEntry {
                    path: file.path.clone(),
                    excerpt: file.content.clone(),
                    score,
                    truncated: false,
                });
                continue;
            }

            // Too big for what's left: take the best contiguous excerpt.
            if remaining < self.min_excerpt_tokens {
                debug!(path = %file.path.display(), remaining, "skipping file; remaining budget below minimum excerpt size");
                continue;
            }
            match best_excerpt(&file.content, &query_terms, remaining) {
                Some(excerpt) => {
                    used += estimate_tokens(&excerpt);
                    entries.push(ContextEntry {
                        path: file.path.clone(),
                        excerpt,
                        score,
                        truncated: true,
                    });
                }
                None => {
                    debug!(path = %file.path.display(), "skipping file; no useful excerpt fits");
                }
            }
        }

        Ok(ContextBundle {
            entries,
            total_tokens: used,
        })
    }
}

/// Lowercased query terms for excerpt scoring.
fn query_terms(description: &str) -> Vec<String> {
    description
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// The contiguous run of lines with the most query-term overlap that fits
/// in `budget_tokens`. Ties resolve to the earliest window, keeping the
/// choice deterministic. Returns None when not even one line fits.
fn best_excerpt(content: &str, query_terms: &[String], budget_tokens: u64) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let line_tokens: Vec<u64> = lines.iter().map(|l| estimate_tokens(l) + 1).collect();
    let line_hits: Vec<u32> = lines
        .iter()
        .map(|line| {
            let lower = line.to_lowercase();
            query_terms.iter().filter(|t| lower.contains(t.as_str())).count() as u32
        })
        .collect();

    // Sliding window over lines, widest run that stays within budget.
    let mut best: Option<(u32, usize, usize)> = None; // (hits, start, end)
    let mut start = 0;
    let mut window_tokens = 0u64;
    let mut window_hits = 0u32;
    for end in 0..lines.len() {
        window_tokens += line_tokens[end];
        window_hits += line_hits[end];
        while window_tokens > budget_tokens && start <= end {
            window_tokens -= line_tokens[start];
            window_hits -= line_hits[start];
            start += 1;
        }
        if start > end {
            continue; // single line alone exceeds the budget
        }
        let better = match best {
            Some((hits, _, _)) => window_hits > hits,
            None => true,
        };
        if better {
            best = Some((window_hits, start, end));
        }
    }

    best.map(|(_, s, e)| lines[s..=e].join("\n"))
}
