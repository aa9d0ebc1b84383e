//! Make-based build tool.

use super::{BuildOptions, BuildOutcome, BuildTool, is_elf, walk_files};
use crate::error::{GhccError, Result};
use crate::exec::{CommandOptions, run_command};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Runs `make --keep-going` and reports ELF files that did not exist before.
#[derive(Debug, Clone)]
pub struct MakeTool {
    program: String,
}

impl Default for MakeTool {
    fn default() -> Self {
        Self {
            program: "make".to_string(),
        }
    }
}

impl MakeTool {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BuildTool for MakeTool {
    fn build(&self, root: &Path, directory: &Path, options: &BuildOptions) -> Result<BuildOutcome> {
        let dir = root.join(directory);
        let before = list_files(&dir)?;

        let args = [self.program.as_str(), "--keep-going", "--jobs=1"];
        let command_options = CommandOptions::new()
            .cwd(&dir)
            .timeout(options.make_timeout());

        let success = match run_command(&args, &command_options) {
            Ok(_) => true,
            Err(GhccError::CommandFailed { outcome, timed_out }) => {
                debug!(
                    directory = %directory.display(),
                    exit_code = outcome.exit_code,
                    timed_out,
                    "Build failed"
                );
                false
            }
            Err(e) => return Err(e),
        };

        let mut binaries: Vec<PathBuf> = list_files(&dir)?
            .into_iter()
            .filter(|path| !before.contains(path) && is_elf(&dir.join(path)))
            .collect();
        binaries.sort();

        Ok(BuildOutcome { binaries, success })
    }
}

/// Relative paths of every regular file under `dir`.
fn list_files(dir: &Path) -> Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for path in walk_files(dir) {
        if let Ok(relative) = path?.strip_prefix(dir) {
            files.insert(relative.to_path_buf());
        }
    }
    Ok(files)
}
