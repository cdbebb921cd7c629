//! Unified-diff structural validation.
//!
//! Parsing here is deliberately strict: the input comes from a
//! non-deterministic generator, and a diff that "mostly" parses is exactly
//! the kind that corrupts a tree. Truncation markers (literal ellipsis
//! tokens or prose placeholders where code should be) are rejected with a
//! distinguishable malformed-patch error before any application attempt,
//! so the review loop can retry with an explicit instruction instead of
//! re-attempting blindly.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::errors::PatchError;

/// Signs of incomplete generation inside patch content lines.
static TRUNCATION_MARKERS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^[+\- ]\s*\.\.\.\s*$",                        // bare ellipsis line
        r"^[+\- ]\s*(//|#)\s*\.\.\.\s*$",               // commented ellipsis
        r"(?i)\[\s*(truncated|snip|omitted)\s*\]",      // [truncated] / [snip]
        r"(?i)rest of (the )?(file|code) (unchanged|omitted)",
        r"(?i)remaining (code|lines) (unchanged|omitted)",
        r"(?i)<\s*(truncated|remainder omitted)\s*>",
    ])
    .expect("truncation marker patterns compile")
});

/// How a patch changes one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One file touched by a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative path (the post-image path, or the pre-image
    /// path for deletions).
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// A structurally validated unified diff.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPatch {
    pub files: Vec<FileChange>,
    /// The original diff text, handed verbatim to git for application.
    pub raw: String,
}

impl ParsedPatch {
    pub fn touched_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}

/// Parse and validate a unified diff.
///
/// Accepts `diff --git` style and bare `---`/`+++` style headers. Rejects
/// empty patches, hunk-less file sections, malformed hunk lines, absolute
/// or traversing paths, and truncation markers.
pub fn parse_patch(text: &str) -> Result<ParsedPatch, PatchError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed("patch text is empty"));
    }

    let mut files: Vec<FileChange> = Vec::new();
    let mut old_path: Option<String> = None;
    let mut in_hunk = false;
    let mut hunks_in_section = 0usize;

    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno + 1;

        if line.starts_with("diff --git ") || line.starts_with("index ")
            || line.starts_with("new file mode") || line.starts_with("deleted file mode")
            || line.starts_with("similarity index") || line.starts_with("rename ")
        {
            in_hunk = false;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            if let Some(prev) = files.last() {
                if hunks_in_section == 0 && prev.kind != ChangeKind::Deleted {
                    return Err(malformed(&format!(
                        "file section for {} has no hunks",
                        prev.path.display()
                    )));
                }
            }
            old_path = Some(rest.trim().to_string());
            in_hunk = false;
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let new = rest.trim();
            let old = old_path.take().ok_or_else(|| {
                malformed(&format!("'+++' without preceding '---' at line {}", lineno))
            })?;
            files.push(classify_file(&old, new)?);
            hunks_in_section = 0;
            in_hunk = false;
            continue;
        }

        if line.starts_with("@@") {
            if files.is_empty() {
                return Err(malformed(&format!("hunk header before any file header at line {}", lineno)));
            }
            if !line.contains("@@ ") && line.len() > 2 && !line[2..].contains("@@") {
                return Err(malformed(&format!("malformed hunk header at line {}", lineno)));
            }
            in_hunk = true;
            hunks_in_section += 1;
            continue;
        }

        if in_hunk {
            if line.is_empty() {
                // Some generators emit empty context lines; tolerate.
                continue;
            }
            match line.as_bytes()[0] {
                b' ' | b'+' | b'-' | b'\\' => {
                    if TRUNCATION_MARKERS.is_match(line) {
                        return Err(malformed(&format!(
                            "truncation marker at line {}: {:?}",
                            lineno, line
                        )));
                    }
                }
                _ => {
                    return Err(malformed(&format!(
                        "invalid hunk line prefix at line {}: {:?}",
                        lineno, line
                    )));
                }
            }
        }
    }

    if files.is_empty() {
        return Err(malformed("no file headers found"));
    }
    if let Some(last) = files.last() {
        if hunks_in_section == 0 && last.kind != ChangeKind::Deleted {
            return Err(malformed(&format!(
                "file section for {} has no hunks",
                last.path.display()
            )));
        }
    }

    Ok(ParsedPatch {
        files,
        raw: text.to_string(),
    })
}

fn classify_file(old: &str, new: &str) -> Result<FileChange, PatchError> {
    let old_is_null = old == "/dev/null";
    let new_is_null = new == "/dev/null";
    let (raw_path, kind) = match (old_is_null, new_is_null) {
        (true, true) => return Err(malformed("both sides of file header are /dev/null")),
        (true, false) => (new, ChangeKind::Added),
        (false, true) => (old, ChangeKind::Deleted),
        (false, false) => (new, ChangeKind::Modified),
    };
    Ok(FileChange {
        path: sanitize_path(raw_path)?,
        kind,
    })
}

/// Strip the `a/`/`b/` prefix and reject absolute or traversing paths.
fn sanitize_path(raw: &str) -> Result<PathBuf, PatchError> {
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    let path = PathBuf::from(stripped);
    if path.is_absolute() {
        return Err(malformed(&format!("absolute path in patch: {}", raw)));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(malformed(&format!("path traversal in patch: {}", raw)));
        }
    }
    if path.as_os_str().is_empty() {
        return Err(malformed("empty path in patch header"));
    }
    Ok(path)
}

fn malformed(reason: &str) -> PatchError {
    PatchError::Malformed {
        reason: reason.to_string(),
    }
}
