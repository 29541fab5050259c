use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::errors::{PipelineError, ProcessError};

use super::process::{self, CommandSpec};
use super::progress::{KeywordProgressFilter, ProgressFilter};
use super::status::JobHandle;

/// Prefix of progress messages published from agent output.
pub const PROGRESS_MARKER: &str = "🤖 ";

/// Longest tail of agent output kept in a failure message.
const FAILURE_OUTPUT_CHARS: usize = 400;

/// Abstraction over the external coding agent for testability.
/// Real implementation: `CliCodingAgent`.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    /// Run the agent in `worktree` with `prompt`, publishing progress to
    /// `job`, until it exits, times out, or `cancel` fires.
    async fn run(
        &self,
        worktree: &Path,
        prompt: &str,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

/// Runs a CLI agent (e.g. `copilot --allow-all-tools`) with the prompt on stdin.
pub struct CliCodingAgent {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    filter: Arc<dyn ProgressFilter>,
}

impl CliCodingAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            filter: Arc::new(KeywordProgressFilter),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.agent_cmd.clone(),
            config.agent_args.clone(),
            config.timeout,
        )
    }

    pub fn with_filter(mut self, filter: Arc<dyn ProgressFilter>) -> Self {
        self.filter = filter;
        self
    }

    fn map_error(&self, err: ProcessError) -> PipelineError {
        match err {
            ProcessError::TimedOut { .. } => PipelineError::AgentTimeout(self.timeout),
            ProcessError::Cancelled { .. } => {
                PipelineError::Cancelled("coding agent was stopped".to_string())
            }
            ProcessError::Spawn { program, source } => {
                PipelineError::Agent(format!("could not start {}: {}", program, source))
            }
            ProcessError::Failed { code, output, .. } => {
                let code = code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let tail = tail_chars(&output, FAILURE_OUTPUT_CHARS);
                if tail.is_empty() {
                    PipelineError::Agent(format!("exited with code {}", code))
                } else {
                    PipelineError::Agent(format!("exited with code {}: {}", code, tail))
                }
            }
            other => PipelineError::Agent(other.to_string()),
        }
    }
}

#[async_trait]
impl CodingAgent for CliCodingAgent {
    async fn run(
        &self,
        worktree: &Path,
        prompt: &str,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let spec = CommandSpec::new(&self.program, worktree)
            .args(self.args.iter().cloned())
            .stdin(prompt)
            .timeout(self.timeout);
        info!(command = %spec.display(), timeout_secs = self.timeout.as_secs(), "Starting coding agent");

        let filter = Arc::clone(&self.filter);
        let progress = job.clone();
        let result = process::run_streaming(&spec, cancel, move |stream, line| {
            debug!(?stream, line, "agent output");
            let (message, meaningful) = filter.classify(line);
            if meaningful {
                progress.update_message(format!("{}{}", PROGRESS_MARKER, message));
            }
        })
        .await;

        match result {
            Ok(_) => {
                info!("Coding agent finished");
                Ok(())
            }
            Err(e) => Err(self.map_error(e)),
        }
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ids::JobKind;
    use crate::agent::models::{AgentJob, JobState};
    use crate::agent::status::AgentStatusStore;

    fn sh_agent(script: &str, timeout: Duration) -> CliCodingAgent {
        CliCodingAgent::new("sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    fn job(store: &AgentStatusStore) -> JobHandle {
        let handle = store.set(AgentJob::pending(1, JobKind::Issue, "Queued"));
        handle.mark_running("Starting");
        handle
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("  short  ", 10), "short");
        assert_eq!(tail_chars("abcdefghij", 4), "...ghij");
    }

    #[tokio::test]
    async fn test_meaningful_lines_are_published_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let handle = job(&store);
        let agent = sh_agent(
            "cat > /dev/null; echo 'Analyzing the issue'; echo 'noise'",
            Duration::from_secs(10),
        );

        agent
            .run(dir.path(), "prompt", &handle, &CancellationToken::new())
            .await
            .unwrap();

        let job = store.get(1).unwrap();
        assert_eq!(job.message, "🤖 Analyzing the issue");
        assert_eq!(job.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_prompt_is_fed_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let handle = job(&store);
        let agent = sh_agent("cat > prompt.txt", Duration::from_secs(10));

        agent
            .run(dir.path(), "Implement issue #1", &handle, &CancellationToken::new())
            .await
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert_eq!(written, "Implement issue #1");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let agent = sh_agent("echo 'model overloaded' >&2; exit 2", Duration::from_secs(10));

        let err = agent
            .run(dir.path(), "", &job(&store), &CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, PipelineError::Agent(_)));
        assert!(msg.contains("code 2"), "{}", msg);
        assert!(msg.contains("model overloaded"), "{}", msg);
    }

    #[tokio::test]
    async fn test_missing_binary_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let agent = CliCodingAgent::new("no-such-agent-binary", vec![], Duration::from_secs(5));
        let err = agent
            .run(dir.path(), "", &job(&store), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Agent(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let agent = sh_agent("sleep 30", Duration::from_millis(300));
        let err = agent
            .run(dir.path(), "", &job(&store), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AgentTimeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStatusStore::new();
        let agent = sh_agent("sleep 30", Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = agent
            .run(dir.path(), "", &job(&store), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
    }
}
