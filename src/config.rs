//! Agent configuration.
//!
//! Settings are layered: built-in defaults, then `.airgit/agent.toml` in the
//! repository (or an explicit `--config` file), then environment variables and
//! CLI flags applied by `main.rs`.
//!
//! ```toml
//! [agent]
//! command = "copilot"
//! args = ["--allow-all-tools"]
//! git_command = "git"
//! gh_command = "gh"
//! worktrees_dir = "/tmp/airgit"
//! timeout_secs = 3600
//! default_branch_fallback = "main"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Default coding agent executable.
pub const DEFAULT_AGENT_CMD: &str = "copilot";

/// Default base directory holding one worktree per running job.
pub const DEFAULT_WORKTREES_DIR: &str = "/tmp/airgit";

/// Default wall-clock limit for one coding agent invocation.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 3600;

/// Runtime configuration shared by both agent pipelines.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Repository the server operates on. May itself be a linked worktree.
    pub repo_path: PathBuf,
    pub worktrees_dir: PathBuf,
    pub agent_cmd: String,
    pub agent_args: Vec<String>,
    pub git_cmd: String,
    pub gh_cmd: String,
    pub timeout: Duration,
    /// Branch used when `refs/remotes/origin/HEAD` cannot be resolved.
    pub default_branch_fallback: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            worktrees_dir: PathBuf::from(DEFAULT_WORKTREES_DIR),
            agent_cmd: DEFAULT_AGENT_CMD.to_string(),
            agent_args: vec!["--allow-all-tools".to_string()],
            git_cmd: "git".to_string(),
            gh_cmd: "gh".to_string(),
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            default_branch_fallback: "main".to_string(),
        }
    }
}

/// Raw TOML structure for `.airgit/agent.toml`
#[derive(Debug, Deserialize)]
struct AgentToml {
    agent: Option<AgentSection>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    command: Option<String>,
    args: Option<Vec<String>>,
    git_command: Option<String>,
    gh_command: Option<String>,
    worktrees_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    default_branch_fallback: Option<String>,
}

impl AgentConfig {
    /// Path of the per-repository config file.
    pub fn default_path(repo_path: &Path) -> PathBuf {
        repo_path.join(".airgit").join("agent.toml")
    }

    /// Load configuration for `repo_path`. An explicit `config_path` must
    /// exist; the implicit `.airgit/agent.toml` is optional.
    pub fn load(repo_path: &Path, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self {
            repo_path: repo_path.to_path_buf(),
            ..Self::default()
        };

        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => {
                let implicit = Self::default_path(repo_path);
                if !implicit.exists() {
                    return Ok(config);
                }
                implicit
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        config.apply_toml(&path, &content)?;
        Ok(config)
    }

    fn apply_toml(&mut self, path: &Path, content: &str) -> Result<(), ConfigError> {
        let toml: AgentToml = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let Some(section) = toml.agent else {
            return Ok(());
        };
        if let Some(command) = section.command {
            self.agent_cmd = command;
        }
        if let Some(args) = section.args {
            self.agent_args = args;
        }
        if let Some(git) = section.git_command {
            self.git_cmd = git;
        }
        if let Some(gh) = section.gh_command {
            self.gh_cmd = gh;
        }
        if let Some(dir) = section.worktrees_dir {
            self.worktrees_dir = dir;
        }
        if let Some(secs) = section.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(branch) = section.default_branch_fallback {
            self.default_branch_fallback = branch;
        }
        Ok(())
    }

    /// Reject settings the pipelines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "agent timeout must be greater than zero".to_string(),
            ));
        }
        if self.agent_cmd.trim().is_empty() {
            return Err(ConfigError::Invalid("agent command is empty".to_string()));
        }
        if self.default_branch_fallback.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default branch fallback is empty".to_string(),
            ));
        }
        if !self.repo_path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "repository path {} does not exist",
                self.repo_path.display()
            )));
        }
        Ok(())
    }
}
