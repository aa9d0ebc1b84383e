//! Worker side of compilation.
//!
//! Runs when `ghcc compile --internal-worker` is invoked. Reads one
//! [`CompileRequest`] from stdin, attempts a build in every directory and
//! writes each result to stdout as soon as it is ready.

use super::ipc::{Frame, LineReader, LineWriter};
use super::proctree;
use super::protocol::{CompileRequest, WorkerMessage};
use crate::build::{BuildDirectoryResult, BuildOptions, BuildTool, MakeTool, file_sha256};
use crate::error::{GhccError, Result};
use crate::pool::ElasticPool;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Recorded digests per artifact, per build directory.
type KnownArtifacts = HashMap<PathBuf, HashMap<PathBuf, String>>;

/// Counts reported in the final `Finished` frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub attempted: usize,
    pub produced: usize,
}

/// Build every directory through `pool`, passing each non-empty result to `emit`.
///
/// Results reach `emit` on the calling thread in completion order, so a
/// single writer can own the output channel. Directories listed in `known`
/// only report artifacts recorded there, with the recorded digests.
pub fn compile_directories<E>(
    root: &Path,
    directories: Vec<PathBuf>,
    known: Vec<BuildDirectoryResult>,
    tool: Arc<dyn BuildTool>,
    options: &BuildOptions,
    pool: &ElasticPool,
    mut emit: E,
) -> Result<CompileSummary>
where
    E: FnMut(BuildDirectoryResult) -> Result<()>,
{
    let root = root.to_path_buf();
    let options = options.clone();
    let attempted = directories.len();
    let known = index_known(known);

    let results = pool.map_unordered(
        move |directory: PathBuf| {
            build_one(
                tool.as_ref(),
                &root,
                &directory,
                &options,
                known.get(&directory),
            )
        },
        directories,
    )?;

    let mut produced = 0;
    for entry in results.flatten() {
        produced += 1;
        emit(entry)?;
    }

    Ok(CompileSummary {
        attempted,
        produced,
    })
}

fn index_known(known: Vec<BuildDirectoryResult>) -> KnownArtifacts {
    known
        .into_iter()
        .map(|entry| {
            let artifacts = entry.binaries.into_iter().zip(entry.digests).collect();
            (entry.directory, artifacts)
        })
        .collect()
}

/// Attempt one directory. Anything short of a produced artifact is skipped.
fn build_one(
    tool: &dyn BuildTool,
    root: &Path,
    directory: &Path,
    options: &BuildOptions,
    recorded: Option<&HashMap<PathBuf, String>>,
) -> Option<BuildDirectoryResult> {
    let outcome = match tool.build(root, directory, options) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(directory = %directory.display(), error = %e, "Build tool could not run");
            return None;
        }
    };
    trace!(
        directory = %directory.display(),
        success = outcome.success,
        binaries = outcome.binaries.len(),
        "Build attempted"
    );

    let build_dir = root.join(directory);
    let artifacts: Vec<(PathBuf, String)> = match recorded {
        Some(recorded) => outcome
            .binaries
            .into_iter()
            .filter_map(|binary| {
                let digest = recorded.get(&binary)?.clone();
                Some((binary, digest))
            })
            .collect(),
        None => outcome
            .binaries
            .into_iter()
            .filter_map(|binary| match file_sha256(build_dir.join(&binary)) {
                Ok(digest) => Some((binary, digest)),
                Err(e) => {
                    debug!(binary = %binary.display(), error = %e, "Skipping unreadable artifact");
                    None
                }
            })
            .collect(),
    };

    if artifacts.is_empty() {
        return None;
    }
    Some(BuildDirectoryResult::new(directory, artifacts))
}

/// Serve one compile request read from `input`, writing frames to `output`.
pub fn run_worker<R: Read, W: Write>(
    input: R,
    output: W,
    tool: Arc<dyn BuildTool>,
) -> Result<CompileSummary> {
    let mut reader = LineReader::new(input);
    let request = match reader.read_frame()? {
        Some(Frame::Complete(line)) => CompileRequest::from_line(line)?,
        Some(Frame::Truncated(_)) | None => {
            return Err(GhccError::Worker("No compile request received".into()));
        }
    };
    debug!(
        root = %request.root.display(),
        directories = request.directories.len(),
        jobs = request.options.jobs,
        "Worker received request"
    );

    let mut pool = ElasticPool::new(request.options.jobs)?;
    let mut writer = LineWriter::new(output);
    let summary = compile_directories(
        &request.root,
        request.directories,
        request.known,
        tool,
        &request.options,
        &pool,
        |entry| {
            writer.write_line(&WorkerMessage::result(entry).to_line()?)?;
            Ok(())
        },
    );
    pool.close();
    pool.join();
    let summary = summary?;

    let finished = WorkerMessage::Finished {
        attempted: summary.attempted,
        produced: summary.produced,
    };
    writer.write_line(&finished.to_line()?)?;
    Ok(summary)
}

/// Run the worker subprocess main function.
///
/// Never returns; exits 0 after the `Finished` frame is written, 1 otherwise.
pub fn run_worker_main() -> ! {
    // Ignore SIGPIPE - a vanished supervisor surfaces as an io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Orphaned build processes re-parent to us and stay visible to the supervisor.
    #[cfg(target_os = "linux")]
    if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
        debug!(error = %e, "Could not become child subreaper");
    }

    let tool: Arc<dyn BuildTool> = Arc::new(MakeTool::new());
    let result = run_worker(io::stdin().lock(), io::stdout().lock(), tool);

    // Background processes the builds left behind were re-parented to us.
    let leftovers = proctree::kill_descendants(Pid::this());
    if leftovers > 0 {
        debug!(leftovers, "Killed processes left behind by builds");
    }

    match result {
        Ok(summary) => {
            debug!(
                attempted = summary.attempted,
                produced = summary.produced,
                "Worker done"
            );
            std::process::exit(0)
        }
        Err(e) => {
            error!(error = %e, "Worker failed");
            std::process::exit(1)
        }
    }
}
