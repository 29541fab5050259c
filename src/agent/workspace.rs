//! Workspace manager: one linked git worktree per pipeline run.
//!
//! All worktree operations run against the *main* repository. The server may
//! itself be started from inside a linked worktree, so the configured path is
//! first resolved with [`resolve_main_repo`].

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::PipelineError;

use super::git::Git;
use super::ids::WorkspaceId;

/// Resolve the root of the main repository for `configured`.
///
/// A linked worktree has a `.git` *file* reading `gitdir: <repo>/.git/worktrees/<name>`;
/// in that case `<repo>` is returned. Anything else is returned unchanged.
pub fn resolve_main_repo(configured: &Path) -> PathBuf {
    let dot_git = configured.join(".git");
    if !dot_git.is_file() {
        return configured.to_path_buf();
    }
    let Ok(content) = std::fs::read_to_string(&dot_git) else {
        return configured.to_path_buf();
    };
    let Some(gitdir) = content
        .lines()
        .find_map(|line| line.trim().strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return configured.to_path_buf();
    };

    let gitdir = {
        let p = PathBuf::from(gitdir);
        if p.is_absolute() { p } else { configured.join(p) }
    };

    // <repo>/.git/worktrees/<name> -> <repo>
    let worktrees = gitdir.parent();
    match worktrees {
        Some(dir) if dir.file_name().is_some_and(|n| n == "worktrees") => dir
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| configured.to_path_buf()),
        _ => configured.to_path_buf(),
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    base_dir: PathBuf,
    fallback_branch: String,
}

impl WorkspaceManager {
    pub fn new(git: Git, base_dir: impl Into<PathBuf>, fallback_branch: impl Into<String>) -> Self {
        Self {
            git,
            base_dir: base_dir.into(),
            fallback_branch: fallback_branch.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, id: &WorkspaceId) -> PathBuf {
        self.base_dir.join(id.dir_name())
    }

    pub async fn ensure_base_dir(&self) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            PipelineError::Setup(format!(
                "Failed to create worktree directory {}: {}",
                self.base_dir.display(),
                e
            ))
        })
    }

    /// Remove leftovers of earlier runs whose directory name starts with
    /// `prefix`. Returns how many were removed. Never fails.
    pub async fn cleanup_stale(&self, repo: &Path, prefix: &str) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.base_dir.display(), error = %e, "No worktree directory to scan");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to scan worktree directory");
                    break;
                }
            };
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(prefix) {
                continue;
            }
            let path = entry.path();
            info!(path = %path.display(), "Removing stale worktree");
            self.force_remove(repo, &path).await;
            removed += 1;
        }

        if removed > 0
            && let Err(e) = self.git.worktree_prune(repo).await
        {
            warn!(error = %e, "git worktree prune failed");
        }
        removed
    }

    /// Default branch of `origin`, or the configured fallback.
    pub async fn default_branch(&self, main_repo: &Path) -> String {
        match self.git.remote_default_branch(main_repo).await {
            Some(branch) => branch,
            None => {
                warn!(
                    fallback = %self.fallback_branch,
                    "Could not resolve refs/remotes/origin/HEAD, using fallback branch"
                );
                self.fallback_branch.clone()
            }
        }
    }

    async fn fetch_best_effort(&self, main_repo: &Path) {
        if let Err(e) = self.git.fetch_origin(main_repo).await {
            warn!(error = %e, "git fetch origin failed, continuing with local refs");
        }
    }

    /// Create a worktree at `path` on a new `branch` cut from the remote
    /// default branch. Returns the default branch name.
    pub async fn create_worktree(
        &self,
        main_repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<String, PipelineError> {
        self.fetch_best_effort(main_repo).await;
        let base = self.default_branch(main_repo).await;

        let remote_ref = format!("origin/{}", base);
        let start = if self
            .git
            .ref_exists(main_repo, &format!("refs/remotes/{}", remote_ref))
            .await
        {
            remote_ref
        } else {
            base.clone()
        };

        info!(path = %path.display(), %branch, %start, "Creating worktree");
        self.git
            .worktree_add_new_branch(main_repo, path, branch, &start)
            .await
            .map_err(|e| PipelineError::Setup(format!("Failed to create worktree: {}", e)))?;
        Ok(base)
    }

    /// Create a worktree at `path` checked out to the existing `branch`,
    /// evicting any other worktree that currently holds it.
    pub async fn create_worktree_for_existing_branch(
        &self,
        main_repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), PipelineError> {
        self.fetch_best_effort(main_repo).await;
        self.evict_branch_holders(main_repo, branch).await;

        let remote_ref = format!("origin/{}", branch);
        let has_remote = self
            .git
            .ref_exists(main_repo, &format!("refs/remotes/{}", remote_ref))
            .await;

        info!(path = %path.display(), %branch, "Creating worktree for existing branch");
        let result = if has_remote {
            self.git
                .worktree_add_reset_branch(main_repo, path, branch, &remote_ref)
                .await
        } else {
            self.git.worktree_add_existing(main_repo, path, branch).await
        };
        result.map_err(|e| {
            PipelineError::Setup(format!("Failed to create worktree for {}: {}", branch, e))
        })
    }

    async fn evict_branch_holders(&self, main_repo: &Path, branch: &str) {
        let entries = match self.git.worktree_list(main_repo).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "git worktree list failed, skipping eviction");
                return;
            }
        };
        let main = canonical(main_repo);
        for entry in entries {
            if entry.branch.as_deref() != Some(branch) {
                continue;
            }
            if canonical(&entry.path) == main {
                warn!(%branch, "Branch is checked out in the main repository, cannot evict");
                continue;
            }
            info!(path = %entry.path.display(), %branch, "Evicting worktree holding branch");
            self.force_remove(main_repo, &entry.path).await;
        }
    }

    /// Forced removal. Failures are logged, never returned.
    pub async fn remove_worktree(&self, main_repo: &Path, path: &Path) {
        info!(path = %path.display(), "Removing worktree");
        self.force_remove(main_repo, path).await;
        if let Err(e) = self.git.worktree_prune(main_repo).await {
            warn!(error = %e, "git worktree prune failed");
        }
    }

    async fn force_remove(&self, repo: &Path, path: &Path) {
        if let Err(e) = self.git.worktree_remove(repo, path).await {
            warn!(path = %path.display(), error = %e, "git worktree remove failed");
        }
        if tokio::fs::try_exists(path).await.unwrap_or(false)
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            warn!(path = %path.display(), error = %e, "Failed to delete worktree directory");
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ids::JobKind;
    use std::fs;
    use std::process::Command;

    #[test]
    fn test_resolve_plain_repository_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        assert_eq!(resolve_main_repo(dir.path()), dir.path());
    }

    #[test]
    fn test_resolve_non_repository_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_main_repo(dir.path()), dir.path());
    }

    #[test]
    fn test_resolve_linked_worktree_to_main_repo() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".git"),
            "gitdir: /repo/.git/worktrees/foo\n",
        )
        .unwrap();
        assert_eq!(resolve_main_repo(dir.path()), PathBuf::from("/repo"));
    }

    #[test]
    fn test_resolve_relative_gitdir() {
        let dir = tempfile::tempdir().unwrap();
        let wt = dir.path().join("wt");
        fs::create_dir(&wt).unwrap();
        fs::write(wt.join(".git"), "gitdir: ../main/.git/worktrees/wt").unwrap();
        assert_eq!(resolve_main_repo(&wt), wt.join("../main"));
    }

    #[test]
    fn test_resolve_submodule_style_gitdir_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".git"), "gitdir: ../.git/modules/sub").unwrap();
        assert_eq!(resolve_main_repo(dir.path()), dir.path());
    }

    #[test]
    fn test_resolve_garbage_git_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".git"), "nonsense").unwrap();
        assert_eq!(resolve_main_repo(dir.path()), dir.path());
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        fs::write(dir.join("README.md"), "# test\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn test_create_and_remove_worktree_without_origin() {
        let repo = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let manager = WorkspaceManager::new(Git::default(), base.path(), "main");
        let id = WorkspaceId::generate(JobKind::Issue, 9);
        let path = manager.path_for(&id);

        let default = manager
            .create_worktree(repo.path(), &path, &id.issue_branch())
            .await
            .unwrap();
        assert_eq!(default, "main");
        assert!(path.join("README.md").exists());

        let resolved = resolve_main_repo(&path);
        assert_eq!(canonical(&resolved), canonical(repo.path()));

        manager.remove_worktree(repo.path(), &path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_worktree_bad_base_is_setup_error() {
        let repo = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let manager = WorkspaceManager::new(Git::default(), base.path(), "does-not-exist");
        let path = base.path().join("issue-1-x");
        let err = manager
            .create_worktree(repo.path(), &path, "airgit/issue-1-x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Setup(_)));
    }

    #[tokio::test]
    async fn test_cleanup_stale_removes_only_matching_prefix() {
        let repo = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let manager = WorkspaceManager::new(Git::default(), base.path(), "main");

        let stale = base.path().join("issue-4-1-0");
        manager
            .create_worktree(repo.path(), &stale, "airgit/issue-4-1-0")
            .await
            .unwrap();
        let plain_dir = base.path().join("issue-4-2-0");
        fs::create_dir(&plain_dir).unwrap();
        let other = base.path().join("issue-42-1-0");
        fs::create_dir(&other).unwrap();

        let removed = manager
            .cleanup_stale(repo.path(), &WorkspaceId::stale_prefix(JobKind::Issue, 4))
            .await;
        assert_eq!(removed, 2);
        assert!(!stale.exists());
        assert!(!plain_dir.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_cleanup_stale_missing_base_dir() {
        let repo = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(Git::default(), repo.path().join("nope"), "main");
        assert_eq!(manager.cleanup_stale(repo.path(), "issue-1-").await, 0);
    }

    #[tokio::test]
    async fn test_existing_branch_evicts_other_holder() {
        let repo = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        git(repo.path(), &["branch", "feature"]);

        let manager = WorkspaceManager::new(Git::default(), base.path(), "main");
        let first = base.path().join("review-1-a");
        manager
            .create_worktree_for_existing_branch(repo.path(), &first, "feature")
            .await
            .unwrap();
        assert!(first.exists());

        let second = base.path().join("review-1-b");
        manager
            .create_worktree_for_existing_branch(repo.path(), &second, "feature")
            .await
            .unwrap();
        assert!(second.join("README.md").exists());
        assert!(!first.exists());

        manager.remove_worktree(repo.path(), &second).await;
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_remove_worktree_on_missing_path_does_not_panic() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let manager = WorkspaceManager::new(Git::default(), repo.path().join("wt"), "main");
        manager
            .remove_worktree(repo.path(), &repo.path().join("wt/missing"))
            .await;
    }
}
