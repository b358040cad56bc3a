//! Invoking the runtime CLI.
//!
//! [`ProcessRunner`] is the seam between the gateway and real processes:
//! short commands go through [`ProcessRunner::run`] (captured output, bounded
//! by a timeout), the long-running workload through [`ProcessRunner::spawn`],
//! which hands back an owned [`ProcessHandle`].

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::RwLock,
    time::Duration,
};

use {
    async_trait::async_trait,
    podvisor_config::RuntimeConfig,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{Result, RuntimeError},
    platform::{BinaryLocator, make_executable},
};

const MAX_OUTPUT_BYTES: usize = 200 * 1024;

/// Outcome of one finished runtime command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Map a non-zero exit to [`RuntimeError::CommandFailed`].
    pub fn into_result(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// An owned, long-running child process. Held behind the lifecycle gate
/// across awaits in spawned tasks, hence `Sync`.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit (SIGTERM on unix).
    async fn terminate(&mut self) -> Result<()>;

    /// Force the process down and reap it.
    async fn kill(&mut self) -> Result<()>;

    /// Wait for exit; returns the exit code, `None` if signalled.
    async fn wait(&mut self) -> Result<Option<i32>>;
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Resolve the runtime binary. Cached after the first success.
    async fn prepare(&self) -> Result<PathBuf>;

    /// Run a command to completion. Non-zero exit is an error.
    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandResult>;

    /// Start a long-running command. `secret_env` is set on the child process
    /// only, never placed on the command line.
    async fn spawn(
        &self,
        args: &[String],
        secret_env: &[(String, Secret<String>)],
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// How a [`terminate_with_grace`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Killed,
}

/// Signal the process, wait up to `grace`, then kill it.
pub async fn terminate_with_grace(
    handle: &mut dyn ProcessHandle,
    grace: Duration,
) -> Result<Termination> {
    if !handle.is_alive() {
        return Ok(Termination::AlreadyExited);
    }

    let pid = handle.id();
    debug!(?pid, grace_ms = grace.as_millis() as u64, "terminating workload process");
    if let Err(e) = handle.terminate().await {
        warn!(?pid, error = %e, "failed to signal workload process");
    }

    match tokio::time::timeout(grace, handle.wait()).await {
        Ok(Ok(code)) => {
            info!(?pid, ?code, "workload process exited");
            Ok(Termination::Graceful)
        },
        Ok(Err(e)) => {
            warn!(?pid, error = %e, "error waiting for workload process, killing");
            handle.kill().await?;
            Ok(Termination::Killed)
        },
        Err(_) => {
            warn!(?pid, "workload process did not exit in time, killing");
            handle.kill().await?;
            Ok(Termination::Killed)
        },
    }
}

fn command_line(binary: &Path, args: &[String]) -> String {
    let program = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());
    if args.is_empty() {
        program
    } else {
        format!("{program} {}", args.join(" "))
    }
}

fn truncate_output(bytes: &[u8], limit: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [output truncated]");
    }
    text
}

// ── CliRunner ───────────────────────────────────────────────────────────────

/// [`ProcessRunner`] over `tokio::process`.
pub struct CliRunner {
    locator: BinaryLocator,
    binary: RwLock<Option<PathBuf>>,
}

impl CliRunner {
    pub fn new(locator: BinaryLocator) -> Self {
        Self {
            locator,
            binary: RwLock::new(None),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(BinaryLocator::from_config(config))
    }

    fn cached_binary(&self) -> Option<PathBuf> {
        self.binary.read().ok().and_then(|b| b.clone())
    }
}

#[async_trait]
impl ProcessRunner for CliRunner {
    async fn prepare(&self) -> Result<PathBuf> {
        if let Some(binary) = self.cached_binary() {
            return Ok(binary);
        }
        let binary = self.locator.resolve()?;
        if let Err(e) = make_executable(&binary) {
            warn!(path = %binary.display(), error = %e, "failed to mark runtime binary executable");
        }
        info!(path = %binary.display(), "using container runtime");
        if let Ok(mut slot) = self.binary.write() {
            *slot = Some(binary.clone());
        }
        Ok(binary)
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandResult> {
        let binary = self.prepare().await?;
        let command = command_line(&binary, args);
        debug!(command = %command, timeout_secs = timeout.as_secs(), "running runtime command");

        let child = Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = CommandResult {
                    exit_code: output.status.code(),
                    stdout: truncate_output(&output.stdout, MAX_OUTPUT_BYTES),
                    stderr: truncate_output(&output.stderr, MAX_OUTPUT_BYTES),
                };
                debug!(
                    command = %command,
                    exit_code = ?result.exit_code,
                    stdout_len = result.stdout.len(),
                    stderr_len = result.stderr.len(),
                    "runtime command finished"
                );
                result.into_result(&command)
            },
            Ok(Err(e)) => Err(RuntimeError::Io(e)),
            Err(_) => {
                warn!(command = %command, "runtime command timed out");
                Err(RuntimeError::Timeout { command, timeout })
            },
        }
    }

    async fn spawn(
        &self,
        args: &[String],
        secret_env: &[(String, Secret<String>)],
    ) -> Result<Box<dyn ProcessHandle>> {
        let binary = self.prepare().await?;
        let command = command_line(&binary, args);
        info!(command = %command, "spawning workload process");

        let mut cmd = Command::new(&binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in secret_env {
            cmd.env(key, value.expose_secret());
        }

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            command: command.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true));
        }

        Ok(Box::new(ChildHandle { child }))
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "podvisor_workload", "{line}");
        } else {
            info!(target: "podvisor_workload", "{line}");
        }
    }
}

/// [`ProcessHandle`] over a `tokio::process::Child`.
pub struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };

            if let Some(pid) = self.child.id() {
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| RuntimeError::message(format!("SIGTERM to {pid} failed: {e}")))?;
            }
        }

        #[cfg(not(unix))]
        self.child.start_kill()?;

        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.child.id() {
            debug!(pid, "dropping workload process handle");
        }
    }
}
