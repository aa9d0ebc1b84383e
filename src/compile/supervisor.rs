//! Compilation supervisor.
//!
//! Runs one worker process per call under a wall-clock budget. The worker's
//! results are drained while it runs; on timeout its whole process tree is
//! killed and whatever was collected so far is returned.
//!
//! Every poll also records the worker's current descendants. A process that
//! leaves the worker's process group and is re-parented away when the worker
//! exits is still found through that record and killed with the rest.

use super::channel::{Drain, ResultChannel};
use super::proc::{WorkerCommand, WorkerProc};
use super::proctree::{Lineage, ProcessTable, ensure_supported, leftovers, sweep, terminate_tree};
use super::protocol::CompileRequest;
use super::signals::analyze_wait_status;
use crate::build::{BuildDirectoryResult, BuildOptions};
use crate::error::{GhccError, Result};
use crate::exec::{CommandOptions, run_command};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How long to wait for killed processes to disappear before reporting them.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between liveness checks.
    pub poll_interval: Duration,
    /// Tolerance added to the budget before the worker is considered timed out.
    pub grace: Duration,
    /// How long to wait after SIGTERM before SIGKILL.
    pub kill_wait: Duration,
    /// Restore a git checkout after a timed-out build.
    pub clean_on_timeout: bool,
    /// Worker process to spawn.
    pub worker: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            clean_on_timeout: true,
            worker: WorkerCommand::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Completed,
    TimedOut,
}

/// Result of one supervised run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Results in the order the worker emitted them.
    pub results: Vec<BuildDirectoryResult>,
    /// `Completed` or `TimedOut`.
    pub state: SupervisorState,
    /// Pid (and process group id) the worker ran as.
    pub worker_pid: Pid,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn timed_out(&self) -> bool {
        self.state == SupervisorState::TimedOut
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    known: Vec<BuildDirectoryResult>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Idle,
            known: Vec::new(),
        }
    }

    /// Artifacts recorded by an earlier run of the same tree.
    ///
    /// The worker then recognizes only these artifacts and reports their
    /// recorded digests instead of hashing again.
    pub fn with_known_artifacts(mut self, known: Vec<BuildDirectoryResult>) -> Self {
        self.known = known;
        self
    }

    /// State after the last transition; `Idle` until a run starts.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Compile `directories` under `root` in a worker, bounded by `budget`.
    ///
    /// A timeout is not an error: the outcome carries the partial results.
    /// Errors are returned only when the worker cannot be started.
    #[instrument(skip(self, directories, options), fields(root = %root.display(), directories = directories.len()))]
    pub fn run(
        &mut self,
        root: &Path,
        directories: &[PathBuf],
        options: &BuildOptions,
        budget: Duration,
    ) -> Result<RunOutcome> {
        self.state = SupervisorState::Idle;
        ensure_supported()?;
        let mut worker = WorkerProc::spawn(&self.config.worker)?;
        let pid = worker.pid();
        let start = Instant::now();
        self.state = SupervisorState::Running;
        debug!(pid = pid.as_raw(), "Worker started");

        let stdout = worker
            .take_stdout()
            .ok_or_else(|| GhccError::Worker("Worker stdout not captured".into()))?;
        let mut channel = ResultChannel::spawn(stdout)?;

        let request = CompileRequest {
            root: root.to_path_buf(),
            directories: directories.to_vec(),
            options: options.clone(),
            known: self.known.clone(),
        };
        if let Err(e) = worker.send_request(&request) {
            // The worker may already be gone; its exit status tells the rest.
            warn!(pid = pid.as_raw(), error = %e, "Could not send compile request");
        }

        let mut results = Vec::new();
        let mut lineage = Lineage::default();
        let deadline = budget + self.config.grace;
        let state = loop {
            channel.drain_into(&mut results);
            if !worker.is_running() {
                break SupervisorState::Completed;
            }
            lineage.record(&ProcessTable::capture(), pid);
            if start.elapsed() > deadline {
                break SupervisorState::TimedOut;
            }
            std::thread::sleep(self.config.poll_interval);
        };

        match state {
            SupervisorState::Completed => {
                if let Some(status) = worker.exit_status() {
                    let reason = analyze_wait_status(status);
                    if !reason.is_success() {
                        warn!(pid = pid.as_raw(), reason = %reason, "Worker exited abnormally");
                    }
                }
            }
            _ => {
                warn!(
                    pid = pid.as_raw(),
                    budget_secs = budget.as_secs_f64(),
                    collected = results.len(),
                    "Compilation timed out; killing worker process tree"
                );
                terminate_tree(pid, self.config.kill_wait);
                if !worker.wait_timeout(self.config.kill_wait)
                    && let Err(e) = worker.kill()
                {
                    warn!(pid = pid.as_raw(), error = %e, "Failed to reap worker");
                }
            }
        }
        // The worker is reaped; from here on only its group and lineage identify its processes.
        sweep(pid, &lineage);

        if channel.drain_until_closed(&mut results, self.config.kill_wait) == Drain::Empty {
            debug!(pid = pid.as_raw(), "Result channel left open");
        }

        if state == SupervisorState::TimedOut && self.config.clean_on_timeout {
            clean_source_tree(root);
        }

        let survivors = wait_for_tree_exit(pid, &lineage, VERIFY_TIMEOUT);
        if !survivors.is_empty() {
            warn!(
                pid = pid.as_raw(),
                survivors = survivors.len(),
                "Worker descendants survived cleanup"
            );
        }

        self.state = state;
        let elapsed = start.elapsed();
        info!(
            state = ?state,
            results = results.len(),
            observed = lineage.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Supervised compilation finished"
        );
        Ok(RunOutcome {
            results,
            state,
            worker_pid: pid,
            elapsed,
        })
    }
}

/// What is left of the worker, re-killing until nothing remains or `timeout` passes.
fn wait_for_tree_exit(pgid: Pid, lineage: &Lineage, timeout: Duration) -> Vec<Pid> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = leftovers(&ProcessTable::capture(), pgid, lineage);
        if remaining.is_empty() || Instant::now() >= deadline {
            return remaining;
        }
        sweep(pgid, lineage);
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Best-effort restore of a git checkout after an interrupted build.
fn clean_source_tree(root: &Path) {
    if !root.join(".git").exists() {
        return;
    }
    let options = CommandOptions::new().cwd(root);
    for args in [
        &["git", "clean", "-xffd"][..],
        &["git", "checkout", "--", "."][..],
    ] {
        if let Err(e) = run_command(args, &options) {
            warn!(root = %root.display(), error = %e, "Failed to clean source tree");
            return;
        }
    }
    debug!(root = %root.display(), "Source tree cleaned");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::proctree::{descendants, group_members, is_alive};
    use crate::compile::protocol::WorkerMessage;
    use std::fs;
    use tempfile::TempDir;

    fn fast_config(script: &str) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(50),
            grace: Duration::from_millis(200),
            kill_wait: Duration::from_secs(1),
            clean_on_timeout: false,
            worker: WorkerCommand::new("sh", ["-c", script]),
        }
    }

    fn entry(dir: &str) -> BuildDirectoryResult {
        BuildDirectoryResult::new(dir, vec![(PathBuf::from("a.out"), "deadbeef".into())])
    }

    fn frame(entry: &BuildDirectoryResult) -> String {
        WorkerMessage::result(entry.clone())
            .to_line()
            .unwrap()
            .trim_end()
            .to_string()
    }

    fn run(script: &str, budget: Duration) -> RunOutcome {
        let tmp = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(fast_config(script));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        let outcome = supervisor
            .run(tmp.path(), &[PathBuf::from("a")], &BuildOptions::default(), budget)
            .unwrap();
        assert_eq!(supervisor.state(), outcome.state);
        outcome
    }

    #[test]
    fn test_completed_round_trip() {
        let a = entry("a");
        let script = format!("printf '%s\\n' '{}'", frame(&a));
        let outcome = run(&script, Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert_eq!(outcome.results, vec![a]);
    }

    #[test]
    fn test_partial_results_then_hang() {
        let (a, b) = (entry("a"), entry("b"));
        let script = format!(
            "printf '%s\\n' '{}' '{}'; exec sleep 1000",
            frame(&a),
            frame(&b)
        );
        let outcome = run(&script, Duration::from_millis(500));
        assert!(outcome.timed_out());
        assert_eq!(outcome.results, vec![a, b]);
    }

    #[test]
    fn test_timeout_kills_whole_tree() {
        let budget = Duration::from_secs(1);
        let outcome = run("sleep 1000 & sleep 1000 & wait", budget);
        assert!(outcome.timed_out());
        assert!(outcome.results.is_empty());
        // budget + grace + one poll, plus slack for the kill sequence
        assert!(outcome.elapsed < budget + Duration::from_millis(250) + Duration::from_secs(2));
        assert!(descendants(outcome.worker_pid).is_empty());
        assert!(group_members(outcome.worker_pid).is_empty());
    }

    #[test]
    fn test_corrupt_frames_are_skipped() {
        let (a, b) = (entry("a"), entry("b"));
        let mismatched = r#"{"type":"result","entry":{"directory":"x","binaries":["p","q"],"sha256":["1"]}}"#;
        let script = format!(
            "printf '%s\\n' '{}' 'garbage' '{}' '{}'; printf '%s' '{{\"type\":\"res'",
            frame(&a),
            mismatched,
            frame(&b)
        );
        let outcome = run(&script, Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert_eq!(outcome.results, vec![a, b]);
    }

    #[test]
    fn test_worker_exiting_immediately() {
        let outcome = run("exit 2", Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_detached_child_is_swept() {
        let a = entry("a");
        let script = format!(
            "sleep 1000 > /dev/null 2>&1 & printf '%s\\n' '{}'",
            frame(&a)
        );
        let outcome = run(&script, Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert_eq!(outcome.results, vec![a]);
        assert!(group_members(outcome.worker_pid).is_empty());
    }

    #[test]
    fn test_new_session_outliving_completed_worker_is_killed() {
        if std::process::Command::new("setsid").arg("--version").output().is_err() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("pid");
        let a = entry("a");
        // The sleeper leaves the worker's group and session, then the worker
        // exits normally and the sleeper is re-parented away from it.
        let script = format!(
            "setsid sh -c 'echo $$ > {}; exec sleep 1000' > /dev/null 2>&1 & printf '%s\\n' '{}'; sleep 1",
            pid_file.display(),
            frame(&a)
        );
        let outcome = run(&script, Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert_eq!(outcome.results, vec![a]);

        let sleeper: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!is_alive(Pid::from_raw(sleeper)));
    }

    #[test]
    fn test_known_artifacts_reach_the_worker() {
        let tmp = TempDir::new().unwrap();
        let request_file = tmp.path().join("request.json");
        let known = vec![entry("src")];
        let script = format!("head -n 1 > {}", request_file.display());
        let mut supervisor = Supervisor::new(fast_config(&script)).with_known_artifacts(known.clone());
        supervisor
            .run(tmp.path(), &[PathBuf::from("src")], &BuildOptions::default(), Duration::from_secs(10))
            .unwrap();

        let request = CompileRequest::from_line(&fs::read(&request_file).unwrap()).unwrap();
        assert_eq!(request.known, known);
        assert_eq!(request.directories, vec![PathBuf::from("src")]);
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = fast_config("");
        config.worker = WorkerCommand::new("/nonexistent/ghcc", ["compile"]);
        let mut supervisor = Supervisor::new(config);
        let result = supervisor.run(tmp.path(), &[], &BuildOptions::default(), Duration::from_secs(1));
        assert!(matches!(result, Err(GhccError::Worker(_))));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.grace, Duration::from_secs(5));
        assert_eq!(config.kill_wait, Duration::from_secs(5));
        assert!(config.clean_on_timeout);
    }
}
