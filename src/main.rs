use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use airgit::agent::server::{self, ServerConfig};
use airgit::config::AgentConfig;

#[derive(Parser)]
#[command(name = "airgit")]
#[command(version, about = "Mobile-friendly Git web GUI with an issue-to-PR coding agent")]
pub struct Cli {
    /// Repository the server operates on (defaults to $HOME)
    #[arg(long, env = "AIRGIT_REPO_PATH")]
    pub repo_path: Option<PathBuf>,

    #[arg(long, env = "AIRGIT_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    #[arg(
        short = 'p',
        long = "port",
        visible_alias = "listen-port",
        env = "AIRGIT_LISTEN_PORT",
        default_value_t = 8080
    )]
    pub port: u16,

    /// Agent config file (defaults to <repo>/.airgit/agent.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Coding agent executable
    #[arg(long, env = "AIRGIT_AGENT_CMD")]
    pub agent_cmd: Option<String>,

    /// Coding agent timeout in seconds
    #[arg(long, env = "AIRGIT_AGENT_TIMEOUT")]
    pub agent_timeout: Option<u64>,

    /// Base directory for per-job worktrees
    #[arg(long, env = "AIRGIT_WORKTREES_DIR")]
    pub worktrees_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn agent_config(cli: &Cli) -> Result<AgentConfig> {
    let repo_path = match &cli.repo_path {
        Some(path) => path.clone(),
        None => dirs::home_dir().context("Cannot determine home directory; pass --repo-path")?,
    };

    let mut config = AgentConfig::load(&repo_path, cli.config.as_deref())?;
    if let Some(cmd) = &cli.agent_cmd {
        config.agent_cmd = cmd.clone();
    }
    if let Some(secs) = cli.agent_timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = &cli.worktrees_dir {
        config.worktrees_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli);

    let agent = agent_config(&cli)?;
    tracing::info!(
        repo = %agent.repo_path.display(),
        worktrees = %agent.worktrees_dir.display(),
        timeout_secs = agent.timeout.as_secs(),
        "Configuration loaded"
    );

    server::start_server(ServerConfig {
        listen_addr: cli.listen_addr,
        port: cli.port,
        agent,
    })
    .await
}
