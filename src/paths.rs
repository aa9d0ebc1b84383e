//! Path utilities for ghcc data storage.

use std::path::{Path, PathBuf};

/// Default database filename.
pub const DB_FILENAME: &str = "ghcc.db";

/// Directory under the data dir holding per-repository metadata.
pub const METADATA_DIRNAME: &str = "metadata";

/// Get the data directory for ghcc.
///
/// - Linux: `~/.local/share/ghcc`
/// - macOS: `~/Library/Application Support/ghcc`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ghcc"))
        .unwrap_or_else(|| PathBuf::from(".ghcc"))
}

/// Get the path to the result store database.
pub fn get_db_path() -> PathBuf {
    get_data_dir().join(DB_FILENAME)
}

/// Get the default metadata directory.
pub fn get_metadata_dir() -> PathBuf {
    get_data_dir().join(METADATA_DIRNAME)
}

/// Metadata directory for one repository: `<metadata_dir>/<owner>/<name>`.
pub fn repo_metadata_dir(metadata_dir: &Path, owner: &str, name: &str) -> PathBuf {
    metadata_dir.join(owner).join(name)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// This handles the case where the shell did not expand it, such as
/// `--db-path=~/ghcc.db`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir_returns_valid_path() {
        let data_dir = get_data_dir();
        let name = data_dir.file_name().unwrap().to_str().unwrap();
        assert!(name == "ghcc" || name == ".ghcc");
    }

    #[test]
    fn test_default_paths_are_in_data_dir() {
        let data_dir = get_data_dir();
        assert!(get_db_path().starts_with(&data_dir));
        assert_eq!(get_db_path().file_name().unwrap(), DB_FILENAME);
        assert_eq!(get_metadata_dir(), data_dir.join("metadata"));
    }

    #[test]
    fn test_repo_metadata_dir() {
        assert_eq!(
            repo_metadata_dir(Path::new("/meta"), "torvalds", "linux"),
            PathBuf::from("/meta/torvalds/linux")
        );
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let expanded = expand_tilde("~/repos/test");
        assert!(!expanded.to_str().unwrap().starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("repos/test"));
    }

    #[test]
    fn test_expand_tilde_other_paths_unchanged() {
        assert_eq!(expand_tilde("/tmp/foo"), PathBuf::from("/tmp/foo"));
        assert_eq!(expand_tilde("./rel"), PathBuf::from("./rel"));
    }
}
