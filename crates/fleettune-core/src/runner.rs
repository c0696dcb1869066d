//! Local process execution.
//!
//! Commands are described by a [`CommandSpec`] and executed through
//! `tokio::process` with optional timeouts. Both one-shot capture
//! ([`run_local_command`]) and line-by-line streaming
//! ([`run_local_command_stream`]) are provided. Everything that runs a
//! process in this crate funnels through here, including the SSH and SCP
//! invocations made on behalf of remote targets.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// A command to be executed, described portably so it can be rendered
/// into a local invocation or wrapped in an `ssh` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Create a spec for the given program with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Render the command line for logging and observability channels.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured output of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Errors from local command execution.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The program could not be started at all.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// I/O failed while feeding stdin or collecting output.
    #[error("i/o failure while running `{command}`: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },

    /// The command did not complete within the allotted time.
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The command ran to completion with a non-zero exit code. The full
    /// captured output rides along for callers that need it.
    #[error("`{command}` exited with code {}: {}", result.exit_code, result.stderr.trim())]
    Exit {
        command: String,
        result: CommandResult,
    },
}

fn build_command(spec: &CommandSpec, want_stdin: bool) -> Command {
    let mut cmd = Command::new(spec.program());
    cmd.args(spec.arguments())
        .stdin(if want_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd
}

async fn feed_stdin(
    child: &mut tokio::process::Child,
    input: Option<&str>,
    command: &str,
) -> Result<(), RunnerError> {
    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| RunnerError::Io {
                    command: command.to_string(),
                    source,
                })?;
            // dropping stdin closes the pipe
        }
    }
    Ok(())
}

/// Run a command locally, capturing stdout and stderr in full.
///
/// `input`, when present, is written to the child's stdin; it is treated
/// as a secret and never logged. A `timeout_secs` of zero means no
/// timeout. A non-zero exit code is reported as [`RunnerError::Exit`]
/// with the captured output attached.
///
/// # Errors
///
/// Returns an error if the command cannot be spawned, fails mid-flight,
/// times out, or exits non-zero.
pub async fn run_local_command(
    spec: &CommandSpec,
    input: Option<&str>,
    timeout_secs: u64,
) -> Result<CommandResult, RunnerError> {
    let command = spec.display();
    debug!(
        cmd = %command,
        input = if input.is_some() { "******" } else { "" },
        timeout_secs,
        "running local command"
    );

    let mut cmd = build_command(spec, input.is_some());
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: command.clone(),
        source,
    })?;
    feed_stdin(&mut child, input, &command).await?;

    let wait = child.wait_with_output();
    let output = if timeout_secs > 0 {
        match timeout(Duration::from_secs(timeout_secs), wait).await {
            Ok(result) => result,
            Err(_) => {
                return Err(RunnerError::Timeout {
                    command,
                    timeout_secs,
                });
            }
        }
    } else {
        wait.await
    }
    .map_err(|source| RunnerError::Io {
        command: command.clone(),
        source,
    })?;

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    };
    if output.status.success() {
        Ok(result)
    } else {
        debug!(cmd = %command, exit_code = result.exit_code, "local command failed");
        Err(RunnerError::Exit { command, result })
    }
}

/// Run a command locally, forwarding output line by line.
///
/// Each output stream is drained by its own task so that a slow consumer
/// on one channel cannot stall the other. The exit code is sent on
/// `exit_tx` exactly once, after both streams reach end-of-file. Closed
/// receivers are tolerated; lines sent after the receiver is dropped are
/// discarded.
///
/// # Errors
///
/// Returns an error if the command cannot be spawned, fails mid-flight,
/// or times out. A non-zero exit code is not an error here; it is
/// reported through `exit_tx`.
pub async fn run_local_command_stream(
    spec: &CommandSpec,
    input: Option<&str>,
    timeout_secs: u64,
    stdout_tx: mpsc::Sender<String>,
    stderr_tx: mpsc::Sender<String>,
    exit_tx: mpsc::Sender<i32>,
) -> Result<(), RunnerError> {
    let command = spec.display();
    debug!(
        cmd = %command,
        input = if input.is_some() { "******" } else { "" },
        timeout_secs,
        "running local command (stream)"
    );

    let mut cmd = build_command(spec, input.is_some());
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: command.clone(),
        source,
    })?;
    feed_stdin(&mut child, input, &command).await?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(forward_lines(stdout, stdout_tx));
    let stderr_task = tokio::spawn(forward_lines(stderr, stderr_tx));

    let status = if timeout_secs > 0 {
        match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                // kill_on_drop reaps the child; the drain tasks end at EOF
                drop(child);
                return Err(RunnerError::Timeout {
                    command,
                    timeout_secs,
                });
            }
        }
    } else {
        child.wait().await
    }
    .map_err(|source| RunnerError::Io {
        command: command.clone(),
        source,
    })?;

    // both drains finish once the pipes hit EOF
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let _ = exit_tx.send(status.code().unwrap_or(-1)).await;
    Ok(())
}

async fn forward_lines<R>(reader: Option<R>, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
