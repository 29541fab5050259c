use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::errors::PipelineError;

use super::coding_agent::{CliCodingAgent, CodingAgent};
use super::git::Git;
use super::github::GitHubCli;
use super::ids::JobKind;
use super::issue_pipeline::{self, IssueTask};
use super::models::AgentJob;
use super::review_pipeline::{self, DeletionDetector, KeywordDeletionDetector, ReviewTask};
use super::status::{AgentStatusStore, JobHandle};
use super::workspace::WorkspaceManager;

/// Everything a pipeline needs to talk to the outside world.
pub struct PipelineContext {
    pub config: AgentConfig,
    pub git: Git,
    pub github: GitHubCli,
    pub workspaces: WorkspaceManager,
    pub agent: Arc<dyn CodingAgent>,
    pub deletions: Arc<dyn DeletionDetector>,
}

impl PipelineContext {
    pub fn from_config(config: AgentConfig) -> Self {
        let git = Git::new(config.git_cmd.clone());
        let workspaces = WorkspaceManager::new(
            git.clone(),
            config.worktrees_dir.clone(),
            config.default_branch_fallback.clone(),
        );
        Self {
            github: GitHubCli::new(config.gh_cmd.clone()),
            agent: Arc::new(CliCodingAgent::from_config(&config)),
            deletions: Arc::new(KeywordDeletionDetector),
            git,
            workspaces,
            config,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn CodingAgent>) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_deletion_detector(mut self, detector: Arc<dyn DeletionDetector>) -> Self {
        self.deletions = detector;
        self
    }
}

/// Fail with `Cancelled` once the job's token has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled(
            "server is shutting down or the job was superseded".to_string(),
        ))
    } else {
        Ok(())
    }
}

#[allow(clippy::borrowed_box)]
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Token of the job currently in flight for one kind and issue.
struct ActiveJob {
    run: u64,
    token: CancellationToken,
}

/// Starts pipelines on background tasks and owns their lifecycle.
///
/// Each job gets a child of the runner's root cancellation token. A new
/// trigger cancels the job still in flight for the same kind and issue; an
/// issue job and a review job for the same issue run side by side.
/// [`AgentRunner::shutdown`] cancels all of them.
#[derive(Clone)]
pub struct AgentRunner {
    ctx: Arc<PipelineContext>,
    store: AgentStatusStore,
    root: CancellationToken,
    active: Arc<Mutex<HashMap<(JobKind, u64), ActiveJob>>>,
    tasks: TaskTracker,
}

impl AgentRunner {
    pub fn new(ctx: PipelineContext, store: AgentStatusStore) -> Self {
        Self {
            ctx: Arc::new(ctx),
            store,
            root: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &AgentStatusStore {
        &self.store
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    /// Number of jobs currently in flight.
    pub fn active_jobs(&self) -> usize {
        self.tasks.len()
    }

    /// Record a `pending` job for `key` and hand out its cancellation token,
    /// cancelling any job of the same kind still running for `key`.
    fn register(&self, key: u64, kind: JobKind, message: &str) -> (JobHandle, CancellationToken) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.store.set(AgentJob::pending(key, kind, message));
        let token = self.root.child_token();
        let entry = ActiveJob {
            run: handle.run_id(),
            token: token.clone(),
        };
        if let Some(previous) = active.insert((kind, key), entry) {
            info!(issue_number = key, %kind, "Superseding running job");
            previous.token.cancel();
        }
        (handle, token)
    }

    fn finish(&self, key: u64, kind: JobKind, handle: &JobHandle) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .get(&(kind, key))
            .is_some_and(|entry| entry.run == handle.run_id())
        {
            active.remove(&(kind, key));
        }
    }

    /// Start the issue pipeline. Returns once the job is recorded as `pending`.
    pub fn start_issue(&self, task: IssueTask) -> AgentJob {
        let key = task.number;
        let (handle, token) = self.register(key, JobKind::Issue, "Agent processing queued");
        let pending = handle
            .snapshot()
            .unwrap_or_else(|| AgentJob::pending(key, JobKind::Issue, ""));

        let runner = self.clone();
        self.tasks.spawn(async move {
            issue_pipeline::run(&runner.ctx, &handle, task, &token).await;
            runner.finish(key, JobKind::Issue, &handle);
        });
        pending
    }

    /// Start the review pipeline. Returns once the job is recorded as `pending`.
    pub fn start_review(&self, task: ReviewTask) -> AgentJob {
        let key = task.issue_number;
        let (handle, token) = self.register(
            key,
            JobKind::Review,
            &format!("Applying review comments to PR #{} queued", task.pr_number),
        );
        let pending = handle
            .snapshot()
            .unwrap_or_else(|| AgentJob::pending(key, JobKind::Review, ""));

        let runner = self.clone();
        self.tasks.spawn(async move {
            review_pipeline::run(&runner.ctx, &handle, task, &token).await;
            runner.finish(key, JobKind::Review, &handle);
        });
        pending
    }

    /// Cancel every job and wait up to `grace` for them to clean up.
    pub async fn shutdown(&self, grace: Duration) {
        let running = self.tasks.len();
        if running > 0 {
            info!(jobs = running, "Cancelling running agent jobs");
        }
        self.root.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Agent jobs did not finish cleanup within {:?}", grace);
        }
    }
}
