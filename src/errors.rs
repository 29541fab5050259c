//! Typed error hierarchy for AirGit.
//!
//! Three top-level enums cover the three layers:
//! - `ProcessError`: spawning and waiting on external commands
//! - `PipelineError`: terminal failures of an agent job, one variant per category
//! - `ConfigError`: invalid configuration detected before the server starts

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from running an external process (`git`, `gh`, the coding agent).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {}: {output}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{program} timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Captured combined output, if the process got far enough to produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ProcessError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Terminal failure of an agent pipeline. The `Display` text is what the
/// polling client sees in the job's `message`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Coding agent failed: {0}")]
    Agent(String),

    #[error("Coding agent timed out after {}s", .0.as_secs())]
    AgentTimeout(Duration),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Pull request creation failed: {0}")]
    PullRequest(String),
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
