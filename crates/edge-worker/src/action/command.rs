//! Subprocess execution with captured output.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::DispatchError;

/// A fully resolved command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs an executable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DispatchError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DispatchError> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DispatchError::Process(format!(
                "failed to spawn {}: {}",
                spec.program.display(),
                e
            ))
        })?;

        // Read both streams concurrently so neither pipe fills up.
        let stdout_handle = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_handle = tokio::spawn(read_pipe(child.stderr.take()));

        let (status, timed_out) = match spec.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => (Some(status), false),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill timed out process");
                    }
                    (None, true)
                }
            },
            None => (Some(child.wait().await), false),
        };

        let exit_code = match status {
            Some(status) => status
                .map_err(|e| DispatchError::Process(format!("failed to wait for process: {}", e)))?
                .code(),
            None => None,
        };

        // Grandchildren may still hold the pipes open after a kill.
        if timed_out {
            stdout_handle.abort();
            stderr_handle.abort();
        }

        Ok(CommandOutput {
            exit_code,
            stdout: stdout_handle.await.unwrap_or_default(),
            stderr: stderr_handle.await.unwrap_or_default(),
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Drain a pipe to the end. Invalid UTF-8 is replaced, never fatal.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::warn!(error = %e, "Failed to read process output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
