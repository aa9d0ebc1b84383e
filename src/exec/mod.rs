//! External command execution.
//!
//! Every external process ghcc runs (make, git, du, ...) goes through
//! [`run_command`]. Output is merged into an anonymous temporary file instead
//! of a pipe, so a child that writes a lot can never block on a full pipe
//! while we wait for it to exit. The file is only read back when the caller
//! asked for the output or the command failed.

mod retry;

pub use retry::{AttemptError, RetryPolicy, retry_transient};

use crate::error::{GhccError, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// How often a command with a timeout is checked for completion.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Program and arguments, as invoked.
    pub command: Vec<String>,
    /// Exit code, or the negated signal number if the process was killed.
    pub exit_code: i32,
    /// Combined stdout/stderr, present when requested or on failure.
    pub captured_output: Option<Vec<u8>>,
}

impl CommandOutcome {
    /// The command as a single space-separated line.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Captured output decoded lossily, or an empty string.
    pub fn output_lossy(&self) -> String {
        self.captured_output
            .as_deref()
            .map(|o| String::from_utf8_lossy(o).into_owned())
            .unwrap_or_default()
    }
}

/// Options for [`run_command`].
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Complete environment for the child. `None` inherits ours.
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory. `None` uses the current directory.
    pub cwd: Option<PathBuf>,
    /// Wall-clock limit; exceeding it kills the command's process group.
    pub timeout: Option<Duration>,
    /// Read the output back even when the command succeeds.
    pub capture_output: bool,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

/// Run a command with the default retry policy.
///
/// Fails with [`GhccError::CommandFailed`] on a non-zero exit or a timeout;
/// those are never retried. OS errors while starting or waiting on the
/// process are retried with backoff and re-raised as [`GhccError::Io`] once
/// the attempts run out.
pub fn run_command<S: AsRef<str>>(args: &[S], options: &CommandOptions) -> Result<CommandOutcome> {
    run_command_with_policy(args, options, &RetryPolicy::default())
}

/// Run a command with an explicit retry policy.
pub fn run_command_with_policy<S: AsRef<str>>(
    args: &[S],
    options: &CommandOptions,
    policy: &RetryPolicy,
) -> Result<CommandOutcome> {
    let command: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    if command.is_empty() {
        return Err(GhccError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty command",
        )));
    }

    retry_transient(
        policy,
        |attempt, err| {
            let mut msg = format!(
                "{} failed attempt(s) for command: '{}'",
                attempt,
                command.join(" ")
            );
            if let Some(cwd) = &options.cwd {
                msg.push_str(&format!(" in working directory '{}'", cwd.display()));
            }
            warn!(attempt, error = %err, "{}", msg);
        },
        || run_once(&command, options),
    )
}

/// Errors that retrying cannot fix.
fn is_permanent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    )
}

fn classify(err: io::Error) -> AttemptError {
    if is_permanent(&err) {
        AttemptError::Fatal(GhccError::Io(err))
    } else {
        AttemptError::Transient(err)
    }
}

fn run_once(command: &[String], options: &CommandOptions) -> std::result::Result<CommandOutcome, AttemptError> {
    let mut output = tempfile::tempfile().map_err(AttemptError::Transient)?;
    let stdout = output.try_clone().map_err(AttemptError::Transient)?;
    let stderr = output.try_clone().map_err(AttemptError::Transient)?;

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);
    if let Some(env) = &options.env {
        cmd.env_clear().envs(env);
    }
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(classify)?;
    let (status, timed_out) = match wait_with_timeout(&mut child, options.timeout) {
        Ok(waited) => waited,
        Err(e) => {
            stop_group(&mut child);
            return Err(AttemptError::Transient(e));
        }
    };

    let exit_code = status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0));
    trace!(
        command = %command.join(" "),
        exit_code,
        timed_out,
        elapsed_ms = start.elapsed().as_millis(),
        "Command finished"
    );

    let failed = timed_out || exit_code != 0;
    let captured_output = if failed || options.capture_output {
        Some(read_back(&mut output).map_err(AttemptError::Transient)?)
    } else {
        None
    };

    let outcome = CommandOutcome {
        command: command.to_vec(),
        exit_code,
        captured_output,
    };

    if failed {
        Err(AttemptError::Fatal(GhccError::CommandFailed { outcome, timed_out }))
    } else {
        Ok(outcome)
    }
}

/// Wait for the child, killing its whole process group once `timeout` passes.
///
/// Returns the exit status and whether the timeout fired.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> io::Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            return Ok((child.wait()?, true));
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// SIGKILL the child's process group, or the child alone if that fails.
fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if killpg(pgid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

/// Kill the child's process group and reap the child.
fn stop_group(child: &mut Child) {
    kill_group(child);
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), error = %e, "Could not reap command");
    }
}

fn read_back(file: &mut File) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
