//! ghcc - supervised, unattended compilation of source trees

mod build;
mod cli;
mod compile;
mod db;
mod disk;
mod driver;
mod error;
mod exec;
mod logging;
mod paths;
mod pool;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use std::io::{IsTerminal, Write};
use std::time::Duration;

use build::BuildOptions;
use cli::{Cli, Commands, CompileArgs, DbCommands};
use compile::SupervisorConfig;
use db::Store;
use driver::DriverConfig;
use logging::LogConfig;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides());

    let result = match &cli.command {
        Commands::Compile(args) => cmd_compile(&cli, args),
        Commands::Db(command) => cmd_db(&cli, command),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn open_store(cli: &Cli) -> Result<Store> {
    let path = paths::expand_tilde(&cli.db_path);
    Store::open_path(&path)
        .with_context(|| format!("Failed to open result store at {}", path.display()))
}

/// Compile every repository under `--repos-dir`, or serve as a worker.
fn cmd_compile(cli: &Cli, args: &CompileArgs) -> Result<()> {
    if args.internal_worker {
        // Never returns
        compile::run_worker_main();
    }

    let Some(repos_dir) = &args.repos_dir else {
        bail!("--repos-dir is required");
    };
    let repos_dir = paths::expand_tilde(repos_dir);
    if !repos_dir.is_dir() {
        bail!("Repository directory {} does not exist", repos_dir.display());
    }

    let store = open_store(cli)?;
    let config = DriverConfig {
        repos_dir,
        metadata_dir: paths::expand_tilde(&args.metadata_dir),
        compile_timeout: Duration::from_secs(args.compile_timeout),
        build: BuildOptions {
            make_timeout_secs: args.make_timeout,
            jobs: args.directory_jobs(),
        },
        repo_jobs: args.repo_jobs(),
        reuse_metadata: args.reuse_metadata,
        show_progress: !cli.quiet && std::io::stderr().is_terminal(),
        supervisor: SupervisorConfig::default(),
    };

    let summary = driver::run_batch(&store, config)?;

    if !cli.quiet {
        eprintln!(
            "{} {} repositories ({} compiled, {} timed out, {} failed, {} already done)",
            "Processed".if_supports_color(Stderr, |text| text.green()),
            summary.repos,
            summary.compiled,
            summary.timed_out,
            summary.failed,
            summary.skipped
        );
        eprintln!(
            "  {} makefiles with binaries, {} binaries",
            summary.makefiles, summary.binaries
        );
    }
    Ok(())
}

fn cmd_db(cli: &Cli, command: &DbCommands) -> Result<()> {
    let store = open_store(cli)?;
    match command {
        DbCommands::Show { repo } => {
            let Some((owner, name)) = repo.split_once('/') else {
                bail!("Expected <owner>/<name>, got '{}'", repo);
            };
            let record = store
                .get(owner, name)?
                .with_context(|| format!("Repository {} not found", repo))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        DbCommands::Stats => {
            let stats = store.stats()?;
            let label = |text: &'static str| {
                format!("{}", text.if_supports_color(Stdout, |t| t.bold()))
            };
            println!("{} {}", label("Database path:"), cli.db_path.display());
            println!("{} {}", label("Repositories:"), stats.repos);
            println!("{} {}", label("Cloned:"), stats.cloned);
            println!("{} {}", label("Compiled:"), stats.compiled);
            println!("{} {}", label("Makefiles:"), stats.makefiles);
            println!("{} {}", label("Binaries:"), stats.binaries);
        }
        DbCommands::Clear { yes } => {
            if !yes && !confirm("Delete every record from the result store?")? {
                eprintln!("Aborted.");
                return Ok(());
            }
            let removed = store.clear()?;
            eprintln!("Removed {} records.", removed);
        }
    }
    Ok(())
}

/// Ask a yes/no question on the terminal. Non-interactive sessions answer no.
fn confirm(question: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    eprint!("{} [y/N] ", question);
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}
