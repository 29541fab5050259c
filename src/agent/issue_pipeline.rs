//! Issue agent pipeline: worktree → coding agent → commit → push → pull request.
//!
//! The job moves `pending -> running -> {completed, failed}`. Every step
//! that fails ends the run with a category-specific [`PipelineError`]. The
//! worktree is removed on every exit path, including panics, before the
//! terminal state is published.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::errors::PipelineError;

use super::github::PullRequestRef;
use super::ids::{JobKind, WorkspaceId};
use super::runner::{PipelineContext, ensure_active, panic_message};
use super::status::JobHandle;
use super::workspace::resolve_main_repo;

/// Issue to hand to the coding agent.
#[derive(Debug, Clone)]
pub struct IssueTask {
    pub number: u64,
    pub title: String,
    pub body: String,
}

#[derive(Debug)]
enum Outcome {
    NoChanges,
    PullRequest(PullRequestRef),
}

/// Resources acquired so far, released by [`run`] whatever the outcome.
#[derive(Debug, Default)]
struct Acquired {
    main_repo: Option<PathBuf>,
    worktree: Option<PathBuf>,
    branch: Option<String>,
    pushed: bool,
}

pub fn build_prompt(task: &IssueTask) -> String {
    let body = if task.body.trim().is_empty() {
        "(no description provided)"
    } else {
        task.body.trim()
    };
    format!(
        "You are working in a git checkout of this repository. Implement the change requested \
by GitHub issue #{number}.\n\n\
Issue title: {title}\n\n\
Issue description:\n{body}\n\n\
Instructions:\n\
1. Read the relevant code and understand what the issue asks for.\n\
2. Make the smallest complete change that resolves it, following the existing style.\n\
3. Add or update tests where it makes sense.\n\
4. Do not commit, push or open pull requests; that is handled for you.\n",
        number = task.number,
        title = task.title.trim(),
        body = body,
    )
}

/// Run the pipeline for `task` to a terminal state.
pub async fn run(
    ctx: &PipelineContext,
    job: &JobHandle,
    task: IssueTask,
    cancel: &CancellationToken,
) {
    let span = info_span!("agent_job", kind = "issue", issue_number = task.number);
    async {
        job.mark_running("Preparing workspace");
        info!(title = %task.title, "Issue pipeline started");

        let mut acquired = Acquired::default();
        let result = AssertUnwindSafe(execute(ctx, job, &task, cancel, &mut acquired))
            .catch_unwind()
            .await;

        release(ctx, &acquired).await;

        match result {
            Ok(Ok(Outcome::NoChanges)) => {
                info!("Agent made no changes");
                job.complete("No changes were necessary", None);
            }
            Ok(Ok(Outcome::PullRequest(pr))) => {
                info!(pr = pr.number, url = %pr.url, "Issue pipeline completed");
                job.complete(
                    format!("Pull request created: {}", pr.url),
                    Some((pr.number, pr.url)),
                );
            }
            Ok(Err(e)) => {
                error!(error = %e, "Issue pipeline failed");
                job.fail(e.to_string());
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "Issue pipeline panicked");
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
    task: &IssueTask,
    cancel: &CancellationToken,
    acquired: &mut Acquired,
) -> Result<Outcome, PipelineError> {
    let main_repo = resolve_main_repo(&ctx.config.repo_path);
    acquired.main_repo = Some(main_repo.clone());

    job.update_message("Cleaning up stale worktrees");
    let stale = ctx
        .workspaces
        .cleanup_stale(
            &main_repo,
            &WorkspaceId::stale_prefix(JobKind::Issue, task.number),
        )
        .await;
    if stale > 0 {
        info!(count = stale, "Removed stale worktrees");
    }

    ctx.workspaces.ensure_base_dir().await?;

    let id = WorkspaceId::generate(JobKind::Issue, task.number);
    let worktree = ctx.workspaces.path_for(&id);
    let branch = id.issue_branch();
    ensure_active(cancel)?;

    job.update_message(format!("Creating worktree on {}", branch));
    acquired.worktree = Some(worktree.clone());
    acquired.branch = Some(branch.clone());
    let base = ctx
        .workspaces
        .create_worktree(&main_repo, &worktree, &branch)
        .await?;
    job.set_branch(&branch);
    ensure_active(cancel)?;

    job.update_message("Checking GitHub authentication");
    ctx.github
        .auth_status(&main_repo)
        .await
        .map_err(|e| PipelineError::Auth(format!("gh is not logged in: {}", e)))?;
    ensure_active(cancel)?;

    job.update_message("Running coding agent");
    ctx.agent
        .run(&worktree, &build_prompt(task), job, cancel)
        .await?;
    ensure_active(cancel)?;

    job.update_message("Staging changes");
    ctx.git
        .add_all(&worktree)
        .await
        .map_err(|e| PipelineError::Commit(format!("git add failed: {}", e)))?;
    let staged = ctx
        .git
        .staged_files(&worktree)
        .await
        .map_err(|e| PipelineError::Commit(format!("Cannot inspect staged changes: {}", e)))?;
    if staged.is_empty() {
        return Ok(Outcome::NoChanges);
    }
    info!(files = staged.len(), "Changes staged");

    job.update_message(format!("Committing {} changed file(s)", staged.len()));
    commit(ctx, &worktree, task).await?;
    ensure_active(cancel)?;

    job.update_message(format!("Pushing {}", branch));
    ctx.git
        .push(&main_repo, &branch, true)
        .await
        .map_err(|e| PipelineError::Push(e.to_string()))?;
    acquired.pushed = true;

    job.update_message("Creating pull request");
    let title = format!("Issue #{}: {}", task.number, task.title.trim());
    let body = format!(
        "Closes #{number}\n\nAutomated implementation for issue #{number}, generated by the AirGit coding agent.",
        number = task.number
    );
    let pr = ctx
        .github
        .pr_create(&main_repo, &base, &branch, &title, &body)
        .await
        .map_err(|e| PipelineError::PullRequest(format!("{:#}", e)))?;
    Ok(Outcome::PullRequest(pr))
}

async fn commit(
    ctx: &PipelineContext,
    worktree: &Path,
    task: &IssueTask,
) -> Result<(), PipelineError> {
    let message = format!("Fix #{}: {}", task.number, task.title.trim());
    ctx.git
        .commit(worktree, &message)
        .await
        .map(|_| ())
        .map_err(|e| PipelineError::Commit(e.to_string()))
}

async fn release(ctx: &PipelineContext, acquired: &Acquired) {
    let Some(main_repo) = &acquired.main_repo else {
        return;
    };
    if let Some(worktree) = &acquired.worktree {
        ctx.workspaces.remove_worktree(main_repo, worktree).await;
    }
    if !acquired.pushed
        && let Some(branch) = &acquired.branch
        && let Err(e) = ctx.git.delete_branch(main_repo, branch).await
    {
        warn!(%branch, error = %e, "Failed to delete unpushed branch");
    }
}
