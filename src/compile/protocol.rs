//! IPC protocol between the supervisor and its worker process.
//!
//! Messages are JSON-serialized and newline-delimited. The supervisor sends a
//! single [`CompileRequest`] on the worker's stdin; the worker answers with a
//! stream of [`WorkerMessage`] frames on stdout.

use crate::build::{BuildDirectoryResult, BuildOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Work handed to a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Source root the directories are relative to.
    pub root: PathBuf,
    /// Candidate build directories.
    pub directories: Vec<PathBuf>,
    /// Options passed to the build tool.
    pub options: BuildOptions,
    /// Artifacts recorded by an earlier run, reused instead of recognizing and hashing anew.
    #[serde(default)]
    pub known: Vec<BuildDirectoryResult>,
}

/// Frame sent from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// A build directory produced artifacts.
    #[serde(rename = "result")]
    Result { entry: BuildDirectoryResult },

    /// All directories have been attempted.
    #[serde(rename = "finished")]
    Finished { attempted: usize, produced: usize },
}

impl CompileRequest {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        to_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line.trim_ascii())
    }
}

impl WorkerMessage {
    pub fn result(entry: BuildDirectoryResult) -> Self {
        Self::Result { entry }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        to_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line.trim_ascii())
    }
}

fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    Ok(json)
}
