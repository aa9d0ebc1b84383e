//! Build collaborators: directory discovery, the build tool, and artifact hashing.
//!
//! The supervision layer only depends on [`BuildTool`], [`discover`] and
//! [`file_sha256`]; [`MakeTool`] is the stock make-based implementation.

mod discover;
mod hash;
mod make;

pub use discover::{discover, is_elf, walk_files};
pub use hash::file_sha256;
pub use make::MakeTool;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-invocation limit for the build tool, in seconds.
pub const DEFAULT_MAKE_TIMEOUT_SECS: u64 = 60;

/// Outcome recorded for one build directory that produced artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDirectoryResult {
    /// Directory containing the Makefile, relative to the source root.
    pub directory: PathBuf,
    /// Produced artifacts, relative to `directory`.
    pub binaries: Vec<PathBuf>,
    /// SHA-256 digests, one per entry in `binaries`.
    #[serde(rename = "sha256")]
    pub digests: Vec<String>,
}

impl BuildDirectoryResult {
    /// Build a result from `(artifact, digest)` pairs.
    pub fn new(directory: impl Into<PathBuf>, artifacts: Vec<(PathBuf, String)>) -> Self {
        let (binaries, digests) = artifacts.into_iter().unzip();
        Self {
            directory: directory.into(),
            binaries,
            digests,
        }
    }

    /// Whether every binary has exactly one digest.
    pub fn is_well_formed(&self) -> bool {
        self.binaries.len() == self.digests.len()
    }

    pub fn num_binaries(&self) -> usize {
        self.binaries.len()
    }
}

/// Options forwarded to the build tool and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Limit for a single build tool invocation, in seconds.
    pub make_timeout_secs: u64,
    /// Pool width used inside the worker (0 = sequential).
    pub jobs: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            make_timeout_secs: DEFAULT_MAKE_TIMEOUT_SECS,
            jobs: 0,
        }
    }
}

impl BuildOptions {
    pub fn make_timeout(&self) -> Duration {
        Duration::from_secs(self.make_timeout_secs)
    }
}

/// What a single build attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Newly produced artifacts, relative to the build directory.
    pub binaries: Vec<PathBuf>,
    /// Whether the build tool exited cleanly.
    pub success: bool,
}

/// Something that can attempt a build in a directory.
pub trait BuildTool: Send + Sync {
    /// Build `directory` (relative to `root`).
    ///
    /// Returns an error only when the tool could not be run at all.
    fn build(&self, root: &Path, directory: &Path, options: &BuildOptions) -> Result<BuildOutcome>;
}
