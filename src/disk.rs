//! Disk usage helpers.

use crate::error::{GhccError, Result};
use crate::exec::{CommandOptions, run_command};
use std::path::Path;

/// Apparent size of everything under `path`, in bytes, as reported by `du -bs`.
pub fn folder_size(path: &Path) -> Result<u64> {
    let path_str = path
        .to_str()
        .ok_or_else(|| GhccError::InvalidPath(path.display().to_string()))?;
    let outcome = run_command(
        &["du", "-bs", path_str],
        &CommandOptions::new().capture_output(true),
    )?;
    let output = outcome.output_lossy();
    output
        .split_whitespace()
        .next()
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| GhccError::InvalidPath(format!("Unexpected du output: {}", output.trim())))
}

/// Human-readable size with two decimals: `"512.00"`, `"1.50K"`, `"2.00M"`.
pub fn readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.2}{}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2}P", size)
}
