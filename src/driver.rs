//! Batch driver for `ghcc compile`.
//!
//! Walks `<repos_dir>/<owner>/<name>`, registers each checkout in the store,
//! compiles the ones not yet compiled under a supervisor, and persists the
//! results. Repositories are compiled concurrently through the elastic pool;
//! every store write happens on the calling thread.

use crate::build::{BuildDirectoryResult, BuildOptions, discover};
use crate::compile::{Supervisor, SupervisorConfig};
use crate::db::Store;
use crate::disk::{folder_size, readable_size};
use crate::error::Result;
use crate::paths::repo_metadata_dir;
use crate::pool::ElasticPool;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// File name of the saved directory list.
pub const DIRECTORIES_FILE: &str = "directories.json";
/// File name of the companion result log.
pub const RESULTS_FILE: &str = "results.json";

/// Settings for one batch run.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub repos_dir: PathBuf,
    pub metadata_dir: PathBuf,
    /// Budget for compiling one repository.
    pub compile_timeout: Duration,
    pub build: BuildOptions,
    /// Repositories compiled concurrently (0 = inline).
    pub repo_jobs: usize,
    pub reuse_metadata: bool,
    pub show_progress: bool,
    pub supervisor: SupervisorConfig,
}

/// Counts reported at the end of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub repos: usize,
    /// Already compiled in a previous run.
    pub skipped: usize,
    pub compiled: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub makefiles: usize,
    pub binaries: usize,
}

/// One checkout found under the repos directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCheckout {
    pub owner: String,
    pub name: String,
    pub path: PathBuf,
}

impl RepoCheckout {
    fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// What a compile job hands back to the driver thread.
struct CompiledRepo {
    results: Vec<BuildDirectoryResult>,
    timed_out: bool,
}

/// Checkouts under `repos_dir`, sorted by owner then name. Hidden entries are skipped.
pub fn list_repos(repos_dir: &Path) -> Result<Vec<RepoCheckout>> {
    let mut repos = Vec::new();
    for owner in visible_dirs(repos_dir)? {
        for repo in visible_dirs(&owner)? {
            let (Some(owner_name), Some(name)) = (file_name(&owner), file_name(&repo)) else {
                continue;
            };
            repos.push(RepoCheckout {
                owner: owner_name,
                name,
                path: repo,
            });
        }
    }
    repos.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
    Ok(repos)
}

fn visible_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && !entry.file_name().to_string_lossy().starts_with('.') {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

/// Register `repo` in the store. Returns true if it still needs compiling.
fn register(store: &Store, repo: &RepoCheckout) -> Result<bool> {
    if let Some(record) = store.get(&repo.owner, &repo.name)? {
        return Ok(!record.compiled);
    }

    let size = match folder_size(&repo.path) {
        Ok(size) => size as i64,
        Err(e) => {
            warn!(repo = %repo.full_name(), error = %e, "Could not measure checkout size");
            -1
        }
    };
    let clone_time = fs::metadata(&repo.path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    store.add_repo(&repo.owner, &repo.name, true, clone_time, size)?;
    debug!(repo = %repo.full_name(), size = %readable_size(size.max(0) as u64), "Registered repository");
    Ok(true)
}

/// Directories to build, plus artifacts recorded for them by an earlier run.
#[derive(Debug, Default, PartialEq)]
struct BuildPlan {
    directories: Vec<PathBuf>,
    known: Vec<BuildDirectoryResult>,
}

/// Plan the build of `repo`, from saved metadata or fresh discovery.
///
/// With `reuse`, a saved result log wins over the saved directory list: its
/// directories are rebuilt and their recorded artifacts and digests reused.
fn build_plan(repo: &RepoCheckout, meta_dir: &Path, reuse: bool) -> Result<BuildPlan> {
    let results = meta_dir.join(RESULTS_FILE);
    if reuse && results.exists() {
        let known: Vec<BuildDirectoryResult> = serde_json::from_slice(&fs::read(&results)?)?;
        debug!(repo = %repo.full_name(), count = known.len(), "Reusing saved result log");
        return Ok(BuildPlan {
            directories: known.iter().map(|entry| entry.directory.clone()).collect(),
            known,
        });
    }

    let saved = meta_dir.join(DIRECTORIES_FILE);
    if reuse && saved.exists() {
        let directories: Vec<PathBuf> = serde_json::from_slice(&fs::read(&saved)?)?;
        debug!(repo = %repo.full_name(), count = directories.len(), "Reusing saved directory list");
        return Ok(BuildPlan {
            directories,
            known: Vec::new(),
        });
    }

    let directories = discover(&repo.path)?;
    fs::create_dir_all(meta_dir)?;
    fs::write(&saved, serde_json::to_vec_pretty(&directories)?)?;
    Ok(BuildPlan {
        directories,
        known: Vec::new(),
    })
}

/// Discover, supervise and log one repository. Runs on a pool thread.
fn compile_repo(repo: &RepoCheckout, config: &DriverConfig) -> Result<CompiledRepo> {
    let meta_dir = repo_metadata_dir(&config.metadata_dir, &repo.owner, &repo.name);
    let BuildPlan { directories, known } = build_plan(repo, &meta_dir, config.reuse_metadata)?;
    if directories.is_empty() {
        return Ok(CompiledRepo {
            results: Vec::new(),
            timed_out: false,
        });
    }

    let mut supervisor = Supervisor::new(config.supervisor.clone()).with_known_artifacts(known);
    let outcome = supervisor.run(
        &repo.path,
        &directories,
        &config.build,
        config.compile_timeout,
    )?;
    debug!(
        repo = %repo.full_name(),
        state = ?supervisor.state(),
        results = outcome.results.len(),
        "Supervisor finished"
    );

    fs::create_dir_all(&meta_dir)?;
    fs::write(
        meta_dir.join(RESULTS_FILE),
        serde_json::to_vec_pretty(&outcome.results)?,
    )?;

    Ok(CompiledRepo {
        timed_out: outcome.timed_out(),
        results: outcome.results,
    })
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
    {
        progress.set_style(style.progress_chars("█▓▒░  "));
    }
    progress
}

/// Compile every repository under `config.repos_dir`.
pub fn run_batch(store: &Store, config: DriverConfig) -> Result<BatchSummary> {
    let repos = list_repos(&config.repos_dir)?;
    let mut summary = BatchSummary {
        repos: repos.len(),
        ..Default::default()
    };

    let mut pending = Vec::new();
    for repo in repos {
        if register(store, &repo)? {
            pending.push(repo);
        } else {
            summary.skipped += 1;
        }
    }
    info!(
        total = summary.repos,
        pending = pending.len(),
        "Starting compilation batch"
    );

    let progress = progress_bar(pending.len(), config.show_progress);
    let abort = Arc::new(AtomicBool::new(false));
    let config = Arc::new(config);
    let mut pool = ElasticPool::new(config.repo_jobs)?;

    let job_abort = Arc::clone(&abort);
    let job_config = Arc::clone(&config);
    let jobs = pool.map_unordered(
        move |repo: RepoCheckout| {
            if job_abort.load(Ordering::Relaxed) {
                return (repo, None);
            }
            let result = compile_repo(&repo, &job_config);
            (repo, Some(result))
        },
        pending,
    )?;

    let mut outcome = Ok(());
    for (repo, result) in jobs {
        progress.inc(1);
        let Some(result) = result else { continue };
        progress.set_message(repo.full_name());

        let compiled = match result {
            Ok(compiled) => compiled,
            Err(e) => {
                summary.failed += 1;
                progress.suspend(|| error!(repo = %repo.full_name(), error = %e, "Compilation failed"));
                continue;
            }
        };

        // Store errors mean the driver and the store disagree; stop the batch.
        if let Err(e) = store.update_build_results(&repo.owner, &repo.name, &compiled.results) {
            abort.store(true, Ordering::Relaxed);
            outcome = Err(e);
            break;
        }

        summary.compiled += 1;
        summary.timed_out += usize::from(compiled.timed_out);
        summary.makefiles += compiled.results.len();
        summary.binaries += compiled
            .results
            .iter()
            .map(BuildDirectoryResult::num_binaries)
            .sum::<usize>();
    }

    progress.finish_and_clear();
    pool.close();
    pool.join();
    outcome?;

    info!(
        compiled = summary.compiled,
        timed_out = summary.timed_out,
        failed = summary.failed,
        "Compilation batch finished"
    );
    Ok(summary)
}
