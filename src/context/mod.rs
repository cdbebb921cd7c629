//! Token-bounded repository context for builder and auditor prompts.
//!
//! A `RepoSnapshot` is taken once per phase attempt and never re-read
//! mid-attempt, so builder and auditor see consistent state. The selector
//! (see [`selector`]) turns a snapshot into a `ContextBundle`: an ordered,
//! relevance-ranked, token-bounded list of file excerpts. Bundles are
//! derived, disposable artifacts: rebuilt fresh per attempt, never
//! persisted.

pub mod embedding;
pub mod selector;

pub use embedding::EmbeddingBackend;
pub use selector::ContextSelector;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 4 chars ≈ 1 token; matches the estimate used for budget reservation.
pub fn estimate_tokens(text: &str) -> u64 {
    text.len() as u64 / 4
}

/// One file captured at snapshot time.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// Path relative to the snapshot root.
    pub path: PathBuf,
    pub content: String,
    /// Modification time in milliseconds since the epoch; tie-breaker for
    /// deterministic ranking.
    pub modified_ms: u64,
}

/// A point-in-time capture of the repository's text files.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub files: Vec<SnapshotFile>,
}

impl RepoSnapshot {
    /// Walk `root` and capture every UTF-8 text file, skipping `.git` and
    /// anything that fails to read as text. Files are held in path order so
    /// the snapshot itself is deterministic for a given tree.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            let modified_ms = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let path = entry
                .path()
                .strip_prefix(root)
                .context("walked path outside snapshot root")?
                .to_path_buf();
            files.push(SnapshotFile {
                path,
                content,
                modified_ms,
            });
        }
        Ok(Self { files })
    }

    pub fn from_files(files: Vec<SnapshotFile>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content fingerprint over paths and contents, for audit records.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(file.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// One selected excerpt in a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub path: PathBuf,
    pub excerpt: String,
    pub score: f32,
    /// Whether the excerpt was truncated to fit the remaining budget.
    pub truncated: bool,
}

/// Ordered, token-bounded slice of the repository for one phase attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub entries: Vec<ContextEntry>,
    pub total_tokens: u64,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the bundle into prompt text. Stable: identical bundles render
    /// byte-identically, so auditors see exactly what the builder saw.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "### {}{}\n```\n{}\n```\n\n",
                entry.path.display(),
                if entry.truncated { " (excerpt)" } else { "" },
                entry.excerpt
            ));
        }
        out
    }
}
