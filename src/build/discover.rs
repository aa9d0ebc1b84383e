//! Makefile discovery.

use crate::error::Result;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// File names make picks up without `-f`.
const MAKEFILE_NAMES: [&str; 3] = ["GNUmakefile", "makefile", "Makefile"];

/// Directories never descended into.
const SKIPPED_DIRS: [&str; 1] = [".git"];

/// Find every directory under `root` containing a Makefile.
///
/// Paths are relative to `root` (the root itself is `""`) and sorted.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for path in walk_files(root) {
        let path = path?;
        let is_makefile = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| MAKEFILE_NAMES.contains(&n));
        if is_makefile
            && let Some(parent) = path.parent()
            && let Ok(relative) = parent.strip_prefix(root)
        {
            found.insert(relative.to_path_buf());
        }
    }
    Ok(found.into_iter().collect())
}

/// Every regular file below `dir`, skipping VCS metadata and symlinks.
pub fn walk_files(dir: &Path) -> impl Iterator<Item = io::Result<PathBuf>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry))
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(io::Error::from(e))),
        })
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|n| SKIPPED_DIRS.contains(&n))
}

/// Whether the file starts with the ELF magic.
pub fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok()
        && magic == *b"\x7fELF"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_finds_makefile_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/lib")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join(".git/hooks")).unwrap();
        fs::write(root.join("Makefile"), "all:\n").unwrap();
        fs::write(root.join("src/lib/makefile"), "all:\n").unwrap();
        fs::write(root.join("docs/README"), "hi").unwrap();
        fs::write(root.join(".git/hooks/Makefile"), "all:\n").unwrap();

        let dirs = discover(root).unwrap();
        assert_eq!(dirs, vec![PathBuf::from(""), PathBuf::from("src/lib")]);
    }

    #[test]
    fn test_discover_empty_tree() {
        let dir = tempdir().unwrap();
        assert!(discover(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_discover_missing_root_is_error() {
        let dir = tempdir().unwrap();
        assert!(discover(&dir.path().join("missing")).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_walk_files_skips_symlinks_and_git() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::write(root.join("a/b/c.txt"), "").unwrap();
        fs::write(root.join("top"), "").unwrap();
        fs::write(root.join(".git/objects/blob"), "").unwrap();
        std::os::unix::fs::symlink(root.join("top"), root.join("a/link")).unwrap();

        let mut files: Vec<PathBuf> = walk_files(root)
            .map(|path| path.unwrap().strip_prefix(root).unwrap().to_path_buf())
            .collect();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("a/b/c.txt"), PathBuf::from("top")]);
    }

    #[test]
    fn test_is_elf() {
        let dir = tempdir().unwrap();
        let elf = dir.path().join("prog");
        let text = dir.path().join("notes.txt");
        let tiny = dir.path().join("tiny");
        fs::write(&elf, b"\x7fELF\x02\x01\x01rest").unwrap();
        fs::write(&text, b"hello world").unwrap();
        fs::write(&tiny, b"\x7f").unwrap();

        assert!(is_elf(&elf));
        assert!(!is_elf(&text));
        assert!(!is_elf(&tiny));
        assert!(!is_elf(&dir.path().join("missing")));
    }
}
