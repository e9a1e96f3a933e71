//! External command execution with cancellation

use crate::error::{HostError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
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

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is not an error here.
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run and fail with [`HostError::CommandFailed`] on a non-zero exit
    async fn run_checked(
        &self,
        cancel: &CancellationToken,
        spec: &CommandSpec,
    ) -> Result<CommandOutput> {
        let output = self.run(cancel, spec).await?;
        if !output.success() {
            error!(command = %spec, code = ?output.code, "Command failed");
            return Err(HostError::CommandFailed {
                command: spec.to_string(),
                status: output
                    .code
                    .map(|c| format!("exit status {}", c))
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(spec.to_string()));
        }
        debug!(command = %spec, "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| HostError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| HostError::Spawn {
                    program: spec.program.clone(),
                    source,
                })?;
        }

        // dropping the wait future kills the child
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(HostError::Cancelled(spec.to_string())),
            output = child.wait_with_output() => output.map_err(|source| HostError::Spawn {
                program: spec.program.clone(),
                source,
            })?,
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
