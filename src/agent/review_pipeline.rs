//! Review agent pipeline: apply PR review comments to the PR's existing branch.
//!
//! Comments that ask for a file to be deleted are applied directly; the rest
//! are handed to the coding agent. The result is committed and pushed to the
//! PR branch, which updates the existing pull request.

use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::errors::PipelineError;

use super::git::CommitOutcome;
use super::ids::{JobKind, WorkspaceId};
use super::models::ReviewComment;
use super::runner::{PipelineContext, ensure_active, panic_message};
use super::status::JobHandle;
use super::workspace::resolve_main_repo;

/// Review comments to apply to one pull request.
#[derive(Debug, Clone)]
pub struct ReviewTask {
    pub issue_number: u64,
    pub pr_number: u64,
    pub comments: Vec<ReviewComment>,
}

/// Decides whether a review comment asks for its file to be deleted.
pub trait DeletionDetector: Send + Sync {
    fn is_deletion_request(&self, body: &str) -> bool;
}

const NATIVE_DELETION_TERMS: &[&str] = &[
    "削除",
    "消去",
    "删除",
    "삭제",
    "supprimer",
    "eliminar",
    "löschen",
    "entfernen",
    "удалить",
];

/// Keyword matcher: "delete"/"remove" together with "file", or a deletion
/// term in another language.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordDeletionDetector;

impl DeletionDetector for KeywordDeletionDetector {
    fn is_deletion_request(&self, body: &str) -> bool {
        let lower = body.to_lowercase();
        let english =
            (lower.contains("delete") || lower.contains("remove")) && lower.contains("file");
        english || NATIVE_DELETION_TERMS.iter().any(|term| lower.contains(term))
    }
}

/// Split of the review comments into direct deletions and agent work.
#[derive(Debug, Default, PartialEq)]
pub struct ReviewPlan {
    pub deletions: Vec<PathBuf>,
    pub agent_comments: Vec<ReviewComment>,
}

/// `path` as a worktree-relative path, or `None` if it is absolute, empty,
/// escapes the worktree or points into `.git`.
pub fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path.trim());
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                if clean.as_os_str().is_empty() && part == ".git" {
                    return None;
                }
                clean.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

pub fn plan_review(comments: &[ReviewComment], detector: &dyn DeletionDetector) -> ReviewPlan {
    let mut plan = ReviewPlan::default();
    for comment in comments {
        let target = comment
            .path
            .as_deref()
            .filter(|_| detector.is_deletion_request(&comment.body));
        match target {
            Some(path) => match safe_relative_path(path) {
                Some(relative) => plan.deletions.push(relative),
                None => {
                    warn!(path, "Refusing to delete path outside the worktree");
                    plan.agent_comments.push(comment.clone());
                }
            },
            None => plan.agent_comments.push(comment.clone()),
        }
    }
    plan
}

pub fn build_prompt(pr_number: u64, comments: &[ReviewComment]) -> String {
    let mut prompt = format!(
        "You are working in a git checkout of the branch behind pull request #{}. \
Apply the following review comments. Do not commit or push; that is handled for you.\n",
        pr_number
    );
    for (i, comment) in comments.iter().enumerate() {
        prompt.push_str(&format!("\n## Comment {}\n", i + 1));
        if let Some(path) = &comment.path {
            match comment.line {
                Some(line) => prompt.push_str(&format!("File: {} (line {})\n", path, line)),
                None => prompt.push_str(&format!("File: {}\n", path)),
            }
        }
        prompt.push_str(comment.body.trim());
        prompt.push('\n');
    }
    prompt
}

/// Result of applying the planned deletions.
#[derive(Debug, Default)]
struct DeletionReport {
    deleted: Vec<PathBuf>,
    already_absent: Vec<PathBuf>,
}

async fn apply_deletions(
    worktree: &Path,
    deletions: &[PathBuf],
) -> Result<DeletionReport, PipelineError> {
    let mut report = DeletionReport::default();
    for relative in deletions {
        let target = worktree.join(relative);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %relative.display(), "Requested deletion already applied");
                report.already_absent.push(relative.clone());
                continue;
            }
            Err(e) => {
                return Err(PipelineError::Commit(format!(
                    "Cannot inspect {}: {}",
                    relative.display(),
                    e
                )));
            }
        };
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        removed.map_err(|e| {
            PipelineError::Commit(format!("Failed to delete {}: {}", relative.display(), e))
        })?;
        info!(path = %relative.display(), "Deleted file requested by review");
        report.deleted.push(relative.clone());
    }
    Ok(report)
}

#[derive(Debug)]
enum Outcome {
    AlreadyApplied,
    AlreadyAddressed,
    Pushed { files: usize },
    PushedEarlierCommits { commits: u64 },
}

#[derive(Debug, Default)]
struct Acquired {
    main_repo: Option<PathBuf>,
    worktree: Option<PathBuf>,
}

pub async fn run(
    ctx: &PipelineContext,
    job: &JobHandle,
    task: ReviewTask,
    cancel: &CancellationToken,
) {
    let span = info_span!(
        "agent_job",
        kind = "review",
        issue_number = task.issue_number,
        pr_number = task.pr_number
    );
    async {
        job.mark_running(format!("Preparing review for PR #{}", task.pr_number));
        info!(comments = task.comments.len(), "Review pipeline started");

        let mut acquired = Acquired::default();
        let mut pr_url = None;
        let pipeline = execute(ctx, job, &task, cancel, &mut acquired, &mut pr_url);
        let result = AssertUnwindSafe(pipeline).catch_unwind().await;

        if let (Some(main_repo), Some(worktree)) = (&acquired.main_repo, &acquired.worktree) {
            ctx.workspaces.remove_worktree(main_repo, worktree).await;
        }

        let pull_request = pr_url
            .filter(|url: &String| !url.is_empty())
            .map(|url| (task.pr_number, url));
        match result {
            Ok(Ok(outcome)) => {
                let message = match outcome {
                    Outcome::AlreadyApplied => {
                        "All requested deletions were already applied".to_string()
                    }
                    Outcome::AlreadyAddressed => "Review comments already addressed".to_string(),
                    Outcome::Pushed { files } => format!(
                        "Pushed {} changed file(s) to PR #{}",
                        files, task.pr_number
                    ),
                    Outcome::PushedEarlierCommits { commits } => format!(
                        "Pushed {} existing commit(s) to PR #{}",
                        commits, task.pr_number
                    ),
                };
                info!(%message, "Review pipeline completed");
                job.complete(message, pull_request);
            }
            Ok(Err(e)) => {
                error!(error = %e, "Review pipeline failed");
                job.fail(e.to_string());
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "Review pipeline panicked");
                job.fail(format!("Internal error: {}", msg));
            }
        }
    }
    .instrument(span)
    .await
}

async fn execute(
    ctx: &PipelineContext,
    job: &JobHandle,
    task: &ReviewTask,
    cancel: &CancellationToken,
    acquired: &mut Acquired,
    pr_url: &mut Option<String>,
) -> Result<Outcome, PipelineError> {
    let main_repo = resolve_main_repo(&ctx.config.repo_path);
    acquired.main_repo = Some(main_repo.clone());

    job.update_message("Cleaning up stale worktrees");
    ctx.workspaces
        .cleanup_stale(
            &main_repo,
            &WorkspaceId::stale_prefix(JobKind::Review, task.issue_number),
        )
        .await;
    ctx.workspaces.ensure_base_dir().await?;

    job.update_message("Checking GitHub authentication");
    ctx.github
        .auth_status(&main_repo)
        .await
        .map_err(|e| PipelineError::Auth(format!("gh is not logged in: {}", e)))?;

    job.update_message(format!("Resolving branch of PR #{}", task.pr_number));
    let info = ctx
        .github
        .pr_view(&main_repo, task.pr_number)
        .await
        .map_err(|e| {
            PipelineError::Setup(format!("Cannot resolve PR #{}: {:#}", task.pr_number, e))
        })?;
    let branch = info.head_ref_name;
    *pr_url = Some(info.url);
    job.set_branch(&branch);
    ensure_active(cancel)?;

    let id = WorkspaceId::generate(JobKind::Review, task.issue_number);
    let worktree = ctx.workspaces.path_for(&id);
    job.update_message(format!("Checking out {}", branch));
    acquired.worktree = Some(worktree.clone());
    ctx.workspaces
        .create_worktree_for_existing_branch(&main_repo, &worktree, &branch)
        .await?;

    let plan = plan_review(&task.comments, ctx.deletions.as_ref());
    let report = apply_deletions(&worktree, &plan.deletions).await?;
    let upstream = format!("origin/{}", branch);

    if plan.agent_comments.is_empty()
        && report.deleted.is_empty()
        && !report.already_absent.is_empty()
    {
        // Every request targeted an absent file; skip the agent if nothing else is pending.
        let dirty = ctx.git.has_uncommitted_changes(&worktree).await.unwrap_or(true);
        let ahead = ctx.git.commits_ahead(&worktree, &upstream).await.unwrap_or(1);
        if !dirty && ahead == 0 {
            return Ok(Outcome::AlreadyApplied);
        }
    }
    ensure_active(cancel)?;

    if plan.agent_comments.is_empty() {
        info!(deleted = report.deleted.len(), "Only deletions requested, skipping coding agent");
    } else {
        job.update_message(format!(
            "Running coding agent on {} comment(s)",
            plan.agent_comments.len()
        ));
        ctx.agent
            .run(
                &worktree,
                &build_prompt(task.pr_number, &plan.agent_comments),
                job,
                cancel,
            )
            .await?;
        ensure_active(cancel)?;
    }

    job.update_message("Committing review changes");
    ctx.git
        .add_all(&worktree)
        .await
        .map_err(|e| PipelineError::Commit(format!("git add failed: {}", e)))?;
    let staged = ctx
        .git
        .staged_files(&worktree)
        .await
        .map_err(|e| PipelineError::Commit(format!("Cannot inspect staged changes: {}", e)))?;
    let message = format!("Address review comments on PR #{}", task.pr_number);
    let outcome = ctx
        .git
        .commit(&worktree, &message)
        .await
        .map_err(|e| PipelineError::Commit(e.to_string()))?;

    let pushed = match outcome {
        CommitOutcome::Committed => Outcome::Pushed {
            files: staged.len(),
        },
        CommitOutcome::NothingToCommit => {
            let ahead = ctx
                .git
                .commits_ahead(&worktree, &upstream)
                .await
                .map_err(|e| {
                    PipelineError::Commit(format!("Cannot compare with {}: {}", upstream, e))
                })?;
            if ahead == 0 {
                return Ok(Outcome::AlreadyAddressed);
            }
            info!(ahead, "Nothing new to commit, pushing earlier commits");
            Outcome::PushedEarlierCommits { commits: ahead }
        }
    };
    ensure_active(cancel)?;

    job.update_message(format!("Pushing {}", branch));
    ctx.git
        .push(&main_repo, &branch, false)
        .await
        .map_err(|e| PipelineError::Push(e.to_string()))?;

    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(path: Option<&str>, body: &str) -> ReviewComment {
        ReviewComment {
            path: path.map(String::from),
            body: body.to_string(),
            line: None,
        }
    }

    #[test]
    fn test_keyword_detector_english() {
        let d = KeywordDeletionDetector;
        assert!(d.is_deletion_request("Please delete this file"));
        assert!(d.is_deletion_request("REMOVE the file, it is unused"));
        assert!(!d.is_deletion_request("Remove this unused import"));
        assert!(!d.is_deletion_request("This file needs a docstring"));
    }

    #[test]
    fn test_keyword_detector_other_languages() {
        let d = KeywordDeletionDetector;
        assert!(d.is_deletion_request("このファイルを削除してください"));
        assert!(d.is_deletion_request("Bitte löschen"));
        assert!(d.is_deletion_request("Merci de supprimer ce fichier"));
        assert!(!d.is_deletion_request("Looks good to me"));
    }

    #[test]
    fn test_safe_relative_path() {
        assert_eq!(safe_relative_path("src/old.rs"), Some(PathBuf::from("src/old.rs")));
        assert_eq!(safe_relative_path("./a.txt"), Some(PathBuf::from("a.txt")));
        assert_eq!(safe_relative_path("/etc/passwd"), None);
        assert_eq!(safe_relative_path("../outside"), None);
        assert_eq!(safe_relative_path("a/../../b"), None);
        assert_eq!(safe_relative_path(".git/config"), None);
        assert_eq!(safe_relative_path(""), None);
        assert_eq!(safe_relative_path("."), None);
    }

    #[test]
    fn test_plan_review_splits_comments() {
        let comments = vec![
            comment(Some("old.txt"), "Please delete this file"),
            comment(None, "Delete the file mentioned above"),
            comment(Some("src/lib.rs"), "Rename this function"),
            comment(Some("../escape"), "remove this file"),
        ];
        let plan = plan_review(&comments, &KeywordDeletionDetector);
        assert_eq!(plan.deletions, vec![PathBuf::from("old.txt")]);
        assert_eq!(plan.agent_comments.len(), 3);
        assert_eq!(plan.agent_comments[2].path.as_deref(), Some("../escape"));
    }

    #[test]
    fn test_build_prompt_lists_each_comment() {
        let mut with_line = comment(Some("src/lib.rs"), "  Rename foo to bar  ");
        with_line.line = Some(12);
        let prompt = build_prompt(7, &[with_line, comment(None, "Add a changelog entry")]);
        assert!(prompt.contains("pull request #7"));
        assert!(prompt.contains("## Comment 1\nFile: src/lib.rs (line 12)\nRename foo to bar\n"));
        assert!(prompt.contains("## Comment 2\nAdd a changelog entry\n"));
    }

    #[tokio::test]
    async fn test_apply_deletions_tracks_present_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        std::fs::write(dir.path().join("folder/inner.txt"), "y").unwrap();

        let report = apply_deletions(
            dir.path(),
            &[
                PathBuf::from("present.txt"),
                PathBuf::from("missing.txt"),
                PathBuf::from("folder"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            report.deleted,
            vec![PathBuf::from("present.txt"), PathBuf::from("folder")]
        );
        assert_eq!(report.already_absent, vec![PathBuf::from("missing.txt")]);
        assert!(!dir.path().join("present.txt").exists());
        assert!(!dir.path().join("folder").exists());
    }
}
