//! Error types for ghcc.

use crate::exec::CommandOutcome;
use thiserror::Error;

/// Main error type for ghcc.
#[derive(Error, Debug)]
pub enum GhccError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}", describe_failure(.outcome, *.timed_out))]
    CommandFailed {
        outcome: CommandOutcome,
        timed_out: bool,
    },

    #[error("Repository {owner}/{name} does not exist in the store")]
    RepoNotFound { owner: String, name: String },

    #[error(
        "Number of makefiles stored for {owner}/{name} ({stored}) does not match provided list ({provided})"
    )]
    Inconsistent {
        owner: String,
        name: String,
        stored: usize,
        provided: usize,
    },

    #[error("Expected exactly one record to be modified, but {0} were")]
    UpdateMismatch(usize),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Pool has been closed")]
    PoolClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type alias for ghcc operations.
pub type Result<T> = std::result::Result<T, GhccError>;

fn describe_failure(outcome: &CommandOutcome, timed_out: bool) -> String {
    let mut message = if timed_out {
        format!("Command '{}' timed out", outcome.command_line())
    } else {
        format!(
            "Command '{}' returned non-zero exit status {}",
            outcome.command_line(),
            outcome.exit_code
        )
    };

    match outcome.captured_output.as_deref() {
        Some(output) if !output.is_empty() => {
            message.push_str("\nCaptured output:\n");
            let text = String::from_utf8_lossy(output);
            let indented: Vec<String> = text.split('\n').map(|line| format!("\t{}", line)).collect();
            message.push_str(&indented.join("\n"));
        }
        _ => message.push_str("\nNo output was generated."),
    }
    message
}
