//! Typed wrappers over the `git` CLI used by the agent pipelines.

use std::path::{Path, PathBuf};

use crate::errors::ProcessError;

use super::process::{self, CommandSpec};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for detached or bare entries.
    pub branch: Option<String>,
}

/// Result of `git commit` when "nothing to commit" is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

#[derive(Debug, Clone)]
pub struct Git {
    program: String,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self, cwd: &Path) -> CommandSpec {
        // Never block a background job on a credential prompt.
        CommandSpec::new(&self.program, cwd).env("GIT_TERMINAL_PROMPT", "0")
    }

    pub async fn fetch_origin(&self, repo: &Path) -> Result<(), ProcessError> {
        process::run(&self.cmd(repo).args(["fetch", "origin"])).await?;
        Ok(())
    }

    /// Default branch advertised by `origin`, from `refs/remotes/origin/HEAD`.
    pub async fn remote_default_branch(&self, repo: &Path) -> Option<String> {
        let spec = self
            .cmd(repo)
            .args(["symbolic-ref", "refs/remotes/origin/HEAD"]);
        let output = process::run(&spec).await.ok()?;
        let name = output
            .stdout
            .trim()
            .strip_prefix("refs/remotes/origin/")?
            .to_string();
        if name.is_empty() { None } else { Some(name) }
    }

    pub async fn ref_exists(&self, repo: &Path, reference: &str) -> bool {
        let spec = self
            .cmd(repo)
            .args(["rev-parse", "--verify", "--quiet", reference]);
        matches!(process::run_unchecked(&spec).await, Ok(out) if out.success())
    }

    /// `git worktree add -b <branch> <path> <start>`
    pub async fn worktree_add_new_branch(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        start: &str,
    ) -> Result<(), ProcessError> {
        let spec = self
            .cmd(repo)
            .args(["worktree", "add", "-b", branch])
            .arg(path.to_string_lossy())
            .arg(start);
        process::run(&spec).await?;
        Ok(())
    }

    /// `git worktree add -B <branch> <path> <start>`, resetting the local
    /// branch to `start`.
    pub async fn worktree_add_reset_branch(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        start: &str,
    ) -> Result<(), ProcessError> {
        let spec = self
            .cmd(repo)
            .args(["worktree", "add", "-B", branch])
            .arg(path.to_string_lossy())
            .arg(start);
        process::run(&spec).await?;
        Ok(())
    }

    /// `git worktree add <path> <branch>` for an existing local branch.
    pub async fn worktree_add_existing(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), ProcessError> {
        let spec = self
            .cmd(repo)
            .args(["worktree", "add"])
            .arg(path.to_string_lossy())
            .arg(branch);
        process::run(&spec).await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), ProcessError> {
        let spec = self
            .cmd(repo)
            .args(["worktree", "remove", "--force"])
            .arg(path.to_string_lossy());
        process::run(&spec).await?;
        Ok(())
    }

    pub async fn worktree_prune(&self, repo: &Path) -> Result<(), ProcessError> {
        process::run(&self.cmd(repo).args(["worktree", "prune"])).await?;
        Ok(())
    }

    pub async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, ProcessError> {
        let spec = self.cmd(repo).args(["worktree", "list", "--porcelain"]);
        let output = process::run(&spec).await?;
        Ok(parse_worktree_list(&output.stdout))
    }

    pub async fn add_all(&self, worktree: &Path) -> Result<(), ProcessError> {
        process::run(&self.cmd(worktree).args(["add", "-A"])).await?;
        Ok(())
    }

    pub async fn staged_files(&self, worktree: &Path) -> Result<Vec<String>, ProcessError> {
        let spec = self.cmd(worktree).args(["diff", "--cached", "--name-only"]);
        let output = process::run(&spec).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn commit(
        &self,
        worktree: &Path,
        message: &str,
    ) -> Result<CommitOutcome, ProcessError> {
        let spec = self.cmd(worktree).args(["commit", "-m", message]);
        let output = process::run_unchecked(&spec).await?;
        if output.success() {
            return Ok(CommitOutcome::Committed);
        }
        if is_nothing_to_commit(&output.combined) {
            return Ok(CommitOutcome::NothingToCommit);
        }
        Err(ProcessError::Failed {
            program: self.program.clone(),
            code: output.code,
            output: output.combined.trim().to_string(),
        })
    }

    pub async fn push(
        &self,
        repo: &Path,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), ProcessError> {
        let mut spec = self.cmd(repo).arg("push");
        if set_upstream {
            spec = spec.arg("-u");
        }
        process::run(&spec.args(["origin", branch])).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), ProcessError> {
        process::run(&self.cmd(repo).args(["branch", "-D", branch])).await?;
        Ok(())
    }

    /// Whether `git status --porcelain` reports anything.
    pub async fn has_uncommitted_changes(&self, worktree: &Path) -> Result<bool, ProcessError> {
        let output = process::run(&self.cmd(worktree).args(["status", "--porcelain"])).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    /// Number of commits on `HEAD` not on `upstream`.
    pub async fn commits_ahead(
        &self,
        worktree: &Path,
        upstream: &str,
    ) -> Result<u64, ProcessError> {
        let range = format!("{}..HEAD", upstream);
        let spec = self.cmd(worktree).args(["rev-list", "--count", range.as_str()]);
        let output = process::run(&spec).await?;
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }
}

fn is_nothing_to_commit(output: &str) -> bool {
    output.contains("nothing to commit") || output.contains("nothing added to commit")
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            let name = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(name.to_string());
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
