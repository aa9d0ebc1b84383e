//! Worker process handle.
//!
//! Wraps the spawned worker with its IPC pipes. The worker is made leader of
//! its own process group so everything it forks can be found and killed as a
//! unit, even after re-parenting.

use super::ipc::LineWriter;
use super::protocol::CompileRequest;
use crate::error::{GhccError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    /// This executable in `compile --internal-worker` mode.
    fn default() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ghcc"));
        Self::new(program, ["compile", "--internal-worker"])
    }
}

impl WorkerCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Handle to a running worker process.
pub struct WorkerProc {
    pid: Pid,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    /// Whether the process has been reaped
    reaped: bool,
    status: Option<WaitStatus>,
}

impl WorkerProc {
    /// Spawn the worker in a fresh process group with piped stdin/stdout.
    ///
    /// Stderr is inherited so worker logs reach the parent's terminal.
    pub fn spawn(command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                GhccError::Worker(format!(
                    "Failed to spawn worker {}: {}",
                    command.program.display(),
                    e
                ))
            })?;

        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        // Reaping is done through waitpid on `pid`; the Child handle is not waited on.
        drop(child);

        Ok(Self {
            pid,
            stdin,
            stdout,
            reaped: false,
            status: None,
        })
    }

    /// Get the process ID (also the process group ID).
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send the compile request and close the worker's stdin.
    pub fn send_request(&mut self, request: &CompileRequest) -> Result<()> {
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| GhccError::Worker("Worker stdin already closed".into()))?;
        let mut writer = LineWriter::new(stdin);
        writer
            .write_line(&request.to_line()?)
            .map_err(|e| GhccError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Take the read end of the result channel.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                false
            }
            Err(_) => {
                self.reaped = true;
                false
            }
        }
    }

    /// How the process ended, once it has been reaped.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        !self.is_running()
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        // ESRCH is impossible for an unreaped child, even a zombie.
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                Ok(())
            }
            Err(e) => Err(GhccError::Worker(format!("waitpid failed: {}", e))),
        }
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.kill();
        }
    }
}
