//! Process runner for `git`, `gh` and the coding agent.
//!
//! Every external command goes through [`run`], [`run_unchecked`] or
//! [`run_streaming`]. Children are spawned in their own process group so a
//! timeout or cancellation can kill the whole tree, not just the direct child.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ProcessError;

/// How long to wait for pipe readers to reach EOF once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A fully described external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            env: Vec::new(),
            env_remove: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Strip a variable from the child's environment. Wins over [`Self::env`].
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable command line for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Both streams interleaved in arrival order.
    pub combined: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a command to completion. A non-zero exit is an error carrying the
/// captured output.
pub async fn run(spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
    let output = run_unchecked(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ProcessError::Failed {
            program: spec.program.clone(),
            code: output.code,
            output: output.combined.trim().to_string(),
        })
    }
}

/// Run a command to completion and return its output whatever the exit code.
pub async fn run_unchecked(spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
    execute(spec, &CancellationToken::new(), |_, _| {}).await
}

/// Run a command while handing every output line to `on_line` as it
/// arrives. Both pipes are read concurrently. The process is killed when
/// `cancel` fires or the spec's timeout elapses.
pub async fn run_streaming<F>(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    on_line: F,
) -> Result<CommandOutput, ProcessError>
where
    F: Fn(OutputStream, &str) + Send + Sync + 'static,
{
    let output = execute(spec, cancel, on_line).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ProcessError::Failed {
            program: spec.program.clone(),
            code: output.code,
            output: output.combined.trim().to_string(),
        })
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Buffers {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    combined: Mutex<String>,
}

impl Buffers {
    fn push(&self, stream: OutputStream, line: &str) {
        let own = match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        };
        if let Ok(mut buf) = own.lock() {
            buf.push_str(line);
            buf.push('\n');
        }
        if let Ok(mut buf) = self.combined.lock() {
            buf.push_str(line);
            buf.push('\n');
        }
    }

    fn take(&self) -> (String, String, String) {
        let take = |m: &Mutex<String>| {
            m.lock()
                .map(|mut s| std::mem::take(&mut *s))
                .unwrap_or_default()
        };
        (take(&self.stdout), take(&self.stderr), take(&self.combined))
    }
}

async fn execute<F>(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    on_line: F,
) -> Result<CommandOutput, ProcessError>
where
    F: Fn(OutputStream, &str) + Send + Sync + 'static,
{
    tracing::debug!(cwd = %spec.cwd.display(), "exec: {}", spec.display());

    let mut child = spec.build().spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        let program = spec.program.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                tracing::debug!("{}: failed to write stdin: {}", program, e);
            }
            // stdin is dropped here, closing the pipe
        });
    }

    let pid = child.id();
    let buffers = Arc::new(Buffers::default());
    let on_line = Arc::new(on_line);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Stdout, &buffers, &on_line));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Stderr, &buffers, &on_line));
    }

    let deadline = async {
        match spec.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = deadline => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(status) => {
            let status = status.map_err(|source| ProcessError::Io {
                program: spec.program.clone(),
                source,
            })?;
            if !drain(&mut readers).await {
                // A pipe is still open, so part of the group outlived the child
                // and its id cannot have been reused yet.
                kill_process_group(pid);
                drain(&mut readers).await;
            }
            abort_all(&readers);
            let (stdout, stderr, combined) = buffers.take();
            Ok(CommandOutput {
                code: status.code(),
                stdout,
                stderr,
                combined,
            })
        }
        Waited::TimedOut => {
            terminate(&mut child, pid).await;
            drain(&mut readers).await;
            abort_all(&readers);
            tracing::warn!("{} killed after exceeding {:?}", spec.program, spec.timeout);
            Err(ProcessError::TimedOut {
                program: spec.program.clone(),
                after: spec.timeout.unwrap_or_default(),
            })
        }
        Waited::Cancelled => {
            terminate(&mut child, pid).await;
            drain(&mut readers).await;
            abort_all(&readers);
            tracing::warn!("{} killed by cancellation", spec.program);
            Err(ProcessError::Cancelled {
                program: spec.program.clone(),
            })
        }
    }
}

fn spawn_reader<R, F>(
    pipe: R,
    stream: OutputStream,
    buffers: &Arc<Buffers>,
    on_line: &Arc<F>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(OutputStream, &str) + Send + Sync + 'static,
{
    let buffers = Arc::clone(buffers);
    let on_line = Arc::clone(on_line);
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&raw);
                    let line = text.trim_end_matches(['\n', '\r']);
                    buffers.push(stream, line);
                    on_line(stream, line);
                }
                Err(e) => {
                    tracing::debug!("output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Kill the child's whole process group and reap the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!("child already gone: {}", e);
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because it was spawned with process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Wait up to [`DRAIN_GRACE`] per reader. Returns whether all of them hit EOF.
async fn drain(readers: &mut [JoinHandle<()>]) -> bool {
    let mut drained = true;
    for reader in readers.iter_mut() {
        if reader.is_finished() {
            continue;
        }
        if tokio::time::timeout(DRAIN_GRACE, &mut *reader).await.is_err() {
            drained = false;
        }
    }
    drained
}

fn abort_all(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}
