//! Atomic, git-backed patch application and rollback.
//!
//! The workspace wraps a git repository as the version-control capability:
//! snapshot commits before each phase, all-or-nothing patch application
//! (a check pass validates every hunk before anything is written), and
//! commit-granular rollback. Rollback restores every touched file to its
//! pre-patch byte content from the parent tree; a deletion whose blob is
//! not in history cannot be restored and is surfaced in the report.

use anyhow::Context;
use chrono::{DateTime, Utc};
use git2::{ApplyLocation, ApplyOptions, Delta, Oid, Repository, Signature};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::PatchError;
use crate::patch::parse::ParsedPatch;
use crate::patch::scope::ScopeSet;

/// Result of a successful governed application.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    /// Commit ref usable for rollback.
    pub commit: String,
    pub files_touched: Vec<PathBuf>,
}

/// Outcome of reverting one commit.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// The commit that was reverted.
    pub reverted_commit: String,
    /// Files restored to their pre-commit content.
    pub restored: Vec<PathBuf>,
    /// Files removed because the commit had added them.
    pub removed: Vec<PathBuf>,
    /// Deletions that could not be restored (no retained copy). Surfaced,
    /// never silently swallowed.
    pub unrestorable: Vec<PathBuf>,
}

pub struct GitWorkspace {
    repo: Repository,
    root: PathBuf,
}

impl GitWorkspace {
    pub fn open(project_dir: &Path) -> Result<Self, PatchError> {
        let repo = Repository::open(project_dir)
            .map_err(PatchError::Git)?;
        Ok(Self {
            root: project_dir.to_path_buf(),
            repo,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit the current tree as a snapshot before a phase attempt.
    /// Handles the unborn-branch case for fresh repositories.
    pub fn snapshot_before(&self, phase_id: &str) -> Result<String, PatchError> {
        self.commit_all(&format!("[foreman] snapshot before phase {}", phase_id))
    }

    /// Validate and apply a parsed patch under the phase's scope.
    ///
    /// Every touched path is re-checked against the scope here; the
    /// applier is the safety boundary, whatever upstream checked. The diff
    /// is dry-run checked first so a failing hunk leaves the tree
    /// untouched, then applied and committed atomically.
    pub fn apply(
        &self,
        patch: &ParsedPatch,
        scope: &ScopeSet,
        phase_id: &str,
    ) -> Result<AppliedPatch, PatchError> {
        for change in &patch.files {
            if !scope.permits(&change.path) {
                return Err(PatchError::ScopeViolation {
                    path: change.path.clone(),
                });
            }
        }

        let diff = git2::Diff::from_buffer(patch.raw.as_bytes())
            .map_err(|e| PatchError::Malformed {
                reason: format!("git rejected diff: {}", e),
            })?;

        // Check pass: validates every hunk without writing.
        let mut check_opts = ApplyOptions::new();
        check_opts.check(true);
        self.repo
            .apply(&diff, ApplyLocation::WorkDir, Some(&mut check_opts))
            .map_err(PatchError::ApplyFailed)?;

        self.repo
            .apply(&diff, ApplyLocation::WorkDir, None)
            .map_err(PatchError::ApplyFailed)?;

        let commit = self.commit_all(&format!("[foreman] apply patch for phase {}", phase_id))?;
        info!(phase = phase_id, commit = %commit, files = patch.files.len(), "patch applied");

        Ok(AppliedPatch {
            commit,
            files_touched: patch.files.iter().map(|f| f.path.clone()).collect(),
        })
    }

    /// Revert a specific prior commit, restoring every file it touched to
    /// its pre-commit byte content.
    pub fn rollback(&self, commit_ref: &str) -> Result<RollbackReport, PatchError> {
        let oid = Oid::from_str(commit_ref).map_err(|_| PatchError::CommitNotFound {
            commit: commit_ref.to_string(),
        })?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|_| PatchError::CommitNotFound {
                commit: commit_ref.to_string(),
            })?;

        let commit_tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None, // initial commit: everything it contains was added
        };

        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&commit_tree), None)?;

        let mut report = RollbackReport {
            reverted_commit: commit_ref.to_string(),
            ..Default::default()
        };

        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added => {
                    let Some(path) = delta.new_file().path() else { continue };
                    let abs = self.root.join(path);
                    if abs.exists() {
                        std::fs::remove_file(&abs)
                            .with_context(|| format!("removing {}", abs.display()))?;
                    }
                    report.removed.push(path.to_path_buf());
                }
                Delta::Modified | Delta::Deleted => {
                    let Some(path) = delta.old_file().path() else { continue };
                    match self.read_blob(parent_tree.as_ref(), path) {
                        Some(content) => {
                            let abs = self.root.join(path);
                            if let Some(parent) = abs.parent() {
                                std::fs::create_dir_all(parent)
                                    .with_context(|| format!("creating {}", parent.display()))?;
                            }
                            std::fs::write(&abs, content)
                                .with_context(|| format!("restoring {}", abs.display()))?;
                            report.restored.push(path.to_path_buf());
                        }
                        None => {
                            warn!(path = %path.display(), "cannot restore file: no retained copy in history");
                            report.unrestorable.push(path.to_path_buf());
                        }
                    }
                }
                _ => {}
            }
        }

        self.commit_all(&format!("[foreman] revert {}", &commit_ref[..commit_ref.len().min(8)]))?;
        info!(
            reverted = commit_ref,
            restored = report.restored.len(),
            removed = report.removed.len(),
            unrestorable = report.unrestorable.len(),
            "rollback complete"
        );
        Ok(report)
    }

    /// Revert all commits made after `since`, newest first.
    pub fn rollback_since(&self, since: DateTime<Utc>) -> Result<Vec<RollbackReport>, PatchError> {
        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

        let cutoff = since.timestamp();
        let mut to_revert = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            if commit.time().seconds() > cutoff {
                to_revert.push(oid.to_string());
            } else {
                break;
            }
        }

        let mut reports = Vec::with_capacity(to_revert.len());
        for sha in to_revert {
            reports.push(self.rollback(&sha)?);
        }
        Ok(reports)
    }

    /// Current HEAD sha, None on an unborn branch.
    pub fn head_sha(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .map(|c| c.id().to_string())
    }

    fn read_blob(&self, tree: Option<&git2::Tree<'_>>, path: &Path) -> Option<Vec<u8>> {
        let entry = tree?.get_path(path).ok()?;
        let blob = self.repo.find_blob(entry.id()).ok()?;
        Some(blob.content().to_vec())
    }

    /// Stage everything (including deletions) and commit.
    fn commit_all(&self, message: &str) -> Result<String, PatchError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("foreman", "foreman@localhost")?;

        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());

        let commit_id = match parent {
            Some(parent) => {
                self.repo
                    .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
            }
            None => self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };
        Ok(commit_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse::parse_patch;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (GitWorkspace, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        drop(repo);
        let ws = GitWorkspace::open(dir.path()).unwrap();
        (ws, dir)
    }

    fn scope(globs: &[&str]) -> ScopeSet {
        ScopeSet::from_globs(&globs.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    const MODIFY_PATCH: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,1 +1,2 @@
 pub fn existing() {}
+pub fn added() {}
";

    fn seed_lib(ws: &GitWorkspace, dir: &Path) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/lib.rs"), "pub fn existing() {}\n").unwrap();
        ws.snapshot_before("seed").unwrap();
    }

    #[test]
    fn test_apply_in_scope_patch_commits() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());

        let patch = parse_patch(MODIFY_PATCH).unwrap();
        let applied = ws.apply(&patch, &scope(&["src/**"]), "01").unwrap();

        assert_eq!(applied.files_touched, vec![PathBuf::from("src/lib.rs")]);
        assert_eq!(ws.head_sha().unwrap(), applied.commit);
        let content = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(content.contains("pub fn added()"));
    }

    #[test]
    fn test_out_of_scope_patch_rejected_without_touching_tree() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());
        let before = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        let head_before = ws.head_sha();

        let patch = parse_patch(MODIFY_PATCH).unwrap();
        let err = ws.apply(&patch, &scope(&["docs/**"]), "01").unwrap_err();

        assert!(err.is_scope_violation());
        assert_eq!(fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(), before);
        assert_eq!(ws.head_sha(), head_before);
    }

    #[test]
    fn test_non_applying_patch_leaves_tree_untouched() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());
        let before = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();

        // Context does not match the real file: check pass must fail.
        let bogus = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,1 +1,2 @@
 pub fn something_else() {}
+pub fn added() {}
";
        let patch = parse_patch(bogus).unwrap();
        let err = ws.apply(&patch, &scope(&["src/**"]), "01").unwrap_err();
        assert!(matches!(err, PatchError::ApplyFailed(_)));
        assert_eq!(fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(), before);
    }

    #[test]
    fn test_rollback_restores_pre_patch_bytes() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());
        let original = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();

        let patch = parse_patch(MODIFY_PATCH).unwrap();
        let applied = ws.apply(&patch, &scope(&["src/**"]), "01").unwrap();

        let report = ws.rollback(&applied.commit).unwrap();
        assert_eq!(report.restored, vec![PathBuf::from("src/lib.rs")]);
        assert!(report.unrestorable.is_empty());
        assert_eq!(fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(), original);
    }

    #[test]
    fn test_rollback_removes_files_the_patch_added() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());

        let add = "\
--- /dev/null
+++ b/src/new.rs
@@ -0,0 +1,1 @@
+pub fn fresh() {}
";
        let patch = parse_patch(add).unwrap();
        let applied = ws.apply(&patch, &scope(&["src/**"]), "02").unwrap();
        assert!(dir.path().join("src/new.rs").exists());

        let report = ws.rollback(&applied.commit).unwrap();
        assert_eq!(report.removed, vec![PathBuf::from("src/new.rs")]);
        assert!(!dir.path().join("src/new.rs").exists());
    }

    #[test]
    fn test_rollback_restores_deleted_file() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());

        let delete = "\
--- a/src/lib.rs
+++ /dev/null
@@ -1,1 +0,0 @@
-pub fn existing() {}
";
        let patch = parse_patch(delete).unwrap();
        let applied = ws.apply(&patch, &scope(&["src/**"]), "03").unwrap();
        assert!(!dir.path().join("src/lib.rs").exists());

        let report = ws.rollback(&applied.commit).unwrap();
        assert_eq!(report.restored, vec![PathBuf::from("src/lib.rs")]);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
            "pub fn existing() {}\n"
        );
    }

    #[test]
    fn test_rollback_unknown_commit() {
        let (ws, _dir) = setup();
        let err = ws.rollback("not-a-sha").unwrap_err();
        assert!(matches!(err, PatchError::CommitNotFound { .. }));
    }

    #[test]
    fn test_rollback_since_reverts_newer_commits() {
        let (ws, dir) = setup();
        seed_lib(&ws, dir.path());

        // Commit timestamps have one-second resolution; sleep so the
        // cutoff falls strictly between the seed and the patch commit.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let patch = parse_patch(MODIFY_PATCH).unwrap();
        ws.apply(&patch, &scope(&["src/**"]), "01").unwrap();

        let reports = ws.rollback_since(cutoff).unwrap();

        // Only the patch commit is newer than the cutoff; the seed
        // survives and the file reverts to its seeded content.
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].restored, vec![PathBuf::from("src/lib.rs")]);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
            "pub fn existing() {}\n"
        );
    }
}
