//! Command-line interface definitions using clap.

use crate::paths;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Supervised, unattended compilation of source trees.
#[derive(Parser, Debug)]
#[command(name = "ghcc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the result store database.
    #[arg(long, global = true, env = "GHCC_DB_PATH", default_value_os_t = paths::get_db_path())]
    pub db_path: PathBuf,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile every repository under a directory.
    Compile(CompileArgs),

    /// Inspect or manage the result store.
    #[command(subcommand)]
    Db(DbCommands),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the compile command.
#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Directory containing checkouts laid out as `<owner>/<name>`.
    #[arg(long, required_unless_present = "internal_worker")]
    pub repos_dir: Option<PathBuf>,

    /// Directory for per-repository metadata (directory lists, result logs).
    #[arg(long, env = "GHCC_METADATA_DIR", default_value_os_t = paths::get_metadata_dir())]
    pub metadata_dir: PathBuf,

    /// Wall-clock budget for compiling one repository, in seconds.
    #[arg(long, default_value_t = 900)]
    pub compile_timeout: u64,

    /// Limit for a single make invocation, in seconds.
    #[arg(long, default_value_t = crate::build::DEFAULT_MAKE_TIMEOUT_SECS)]
    pub make_timeout: u64,

    /// Repositories compiled concurrently.
    #[arg(short, long, default_value_t = num_cpus())]
    pub jobs: usize,

    /// Build directories compiled concurrently inside each worker.
    #[arg(long, default_value_t = 0)]
    pub worker_jobs: usize,

    /// Disable all parallelism.
    #[arg(long)]
    pub single_thread: bool,

    /// Reuse saved results (or the saved directory list) instead of re-discovering Makefiles.
    #[arg(long)]
    pub reuse_metadata: bool,

    /// Run as a compilation worker (used internally).
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

impl CompileArgs {
    /// Pool width for repositories.
    pub fn repo_jobs(&self) -> usize {
        if self.single_thread { 0 } else { self.jobs }
    }

    /// Pool width inside each worker.
    pub fn directory_jobs(&self) -> usize {
        if self.single_thread {
            0
        } else {
            self.worker_jobs
        }
    }
}

/// Result store subcommands.
#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Print the record for one repository as JSON.
    Show {
        /// Repository as `owner/name`.
        repo: String,
    },

    /// Show store statistics.
    Stats,

    /// Delete every record.
    Clear {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "ghcc",
            &mut std::io::stdout(),
        );
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_compile_defaults() {
        let args = Cli::try_parse_from(["ghcc", "compile", "--repos-dir", "/repos"]).unwrap();
        match args.command {
            Commands::Compile(compile) => {
                assert_eq!(compile.repos_dir, Some(PathBuf::from("/repos")));
                assert_eq!(compile.compile_timeout, 900);
                assert_eq!(compile.make_timeout, 60);
                assert_eq!(compile.worker_jobs, 0);
                assert!(!compile.reuse_metadata);
                assert!(!compile.internal_worker);
            }
            _ => panic!("Expected Compile command"),
        }
    }

    #[test]
    fn test_single_thread_zeroes_widths() {
        let args = Cli::try_parse_from([
            "ghcc",
            "compile",
            "--repos-dir",
            "/repos",
            "--jobs",
            "8",
            "--worker-jobs",
            "4",
            "--single-thread",
        ])
        .unwrap();
        match args.command {
            Commands::Compile(compile) => {
                assert_eq!(compile.repo_jobs(), 0);
                assert_eq!(compile.directory_jobs(), 0);
            }
            _ => panic!("Expected Compile command"),
        }
    }

    #[test]
    fn test_compile_requires_repos_dir() {
        assert!(Cli::try_parse_from(["ghcc", "compile"]).is_err());
        assert!(Cli::try_parse_from(["ghcc", "compile", "--internal-worker"]).is_ok());
    }

    #[test]
    fn test_db_commands() {
        let args = Cli::try_parse_from(["ghcc", "db", "show", "torvalds/linux"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Db(DbCommands::Show { ref repo }) if repo == "torvalds/linux"
        ));

        let args = Cli::try_parse_from(["ghcc", "db", "clear", "--yes"]).unwrap();
        assert!(matches!(args.command, Commands::Db(DbCommands::Clear { yes: true })));
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from(["ghcc", "db", "stats", "-vv", "--no-color"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["ghcc", "-v", "-q", "db", "stats"]);
        assert!(result.is_err());
    }
}
