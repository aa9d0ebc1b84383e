//! Result store for per-repository compilation outcomes.
//!
//! One SQLite row per `(owner, name)`. Build results are stored as a JSON
//! document next to aggregate counters that are kept in sync on update.

use crate::build::BuildDirectoryResult;
use crate::error::{GhccError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default timeout for SQLite busy handler (in seconds).
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Where and how to open the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long to retry when another process holds the database lock.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(crate::paths::get_db_path())
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS),
        }
    }
}

/// Stored state of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoRecord {
    pub owner: String,
    pub name: String,
    pub clone_successful: bool,
    pub compiled: bool,
    /// Size of the checkout in bytes, -1 when unknown.
    pub size_bytes: i64,
    pub clone_time: Option<DateTime<Utc>>,
    pub num_makefiles: usize,
    pub num_binaries: usize,
    pub makefiles: Vec<BuildDirectoryResult>,
}

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub repos: usize,
    pub cloned: usize,
    pub compiled: usize,
    pub makefiles: usize,
    pub binaries: usize,
}

/// Database connection wrapper.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.path.as_path();
        if path.is_dir() {
            let path_str = path.display().to_string();
            return Err(GhccError::InvalidPath(format!(
                "'{}' is a directory, not a file. Expected a path like '{}/ghcc.db'",
                path_str,
                path_str.trim_end_matches('/')
            )));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open the store at `path` with default settings.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&StoreConfig::new(path.as_ref()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repos (
                id INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                clone_successful INTEGER NOT NULL,
                compiled INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT -1,
                clone_time INTEGER,
                num_makefiles INTEGER NOT NULL DEFAULT 0,
                num_binaries INTEGER NOT NULL DEFAULT 0,
                makefiles TEXT NOT NULL DEFAULT '[]',
                UNIQUE(owner, name)
            );

            CREATE INDEX IF NOT EXISTS idx_repos_compiled ON repos(compiled);
            "#,
        )?;

        if self.get_meta("schema_version")?.is_none() {
            self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
        }
        Ok(())
    }

    /// Get a metadata value by key.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Set a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Record a cloned repository. Does nothing if `(owner, name)` already exists.
    ///
    /// Returns whether a new record was inserted.
    #[instrument(skip(self, clone_time))]
    pub fn add_repo(
        &self,
        owner: &str,
        name: &str,
        clone_successful: bool,
        clone_time: Option<DateTime<Utc>>,
        size_bytes: i64,
    ) -> Result<bool> {
        let changes = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO repos (owner, name, clone_successful, size_bytes, clone_time)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                owner,
                name,
                clone_successful,
                size_bytes,
                clone_time.map(|t| t.timestamp())
            ],
        )?;
        Ok(changes == 1)
    }

    /// Fetch the record for `(owner, name)`.
    pub fn get(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT clone_successful, compiled, size_bytes, clone_time,
                       num_makefiles, num_binaries, makefiles
                FROM repos WHERE owner = ? AND name = ?
                "#,
                [owner, name],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((clone_successful, compiled, size_bytes, clone_time, makefiles, binaries, json)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(RepoRecord {
            owner: owner.to_string(),
            name: name.to_string(),
            clone_successful,
            compiled,
            size_bytes,
            clone_time: clone_time.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            num_makefiles: makefiles as usize,
            num_binaries: binaries as usize,
            makefiles: serde_json::from_str(&json)?,
        }))
    }

    /// Mark `(owner, name)` compiled and store its build results.
    ///
    /// Fails with [`GhccError::Inconsistent`] if results of a different
    /// length were already stored; the record is left unchanged.
    #[instrument(skip(self, results), fields(results = results.len()))]
    pub fn update_build_results(
        &self,
        owner: &str,
        name: &str,
        results: &[BuildDirectoryResult],
    ) -> Result<()> {
        let record = self
            .get(owner, name)?
            .ok_or_else(|| GhccError::RepoNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            })?;

        if record.num_makefiles > 0 && record.num_makefiles != results.len() {
            return Err(GhccError::Inconsistent {
                owner: owner.to_string(),
                name: name.to_string(),
                stored: record.num_makefiles,
                provided: results.len(),
            });
        }

        let num_binaries: usize = results.iter().map(BuildDirectoryResult::num_binaries).sum();
        let json = serde_json::to_string(results)?;

        // The length guard is repeated in SQL so a concurrent writer cannot slip in between.
        let changes = self.conn.execute(
            r#"
            UPDATE repos
            SET compiled = 1, makefiles = ?1, num_makefiles = ?2, num_binaries = ?3
            WHERE owner = ?4 AND name = ?5 AND (num_makefiles = 0 OR num_makefiles = ?2)
            "#,
            params![
                json,
                results.len() as i64,
                num_binaries as i64,
                owner,
                name
            ],
        )?;
        if changes != 1 {
            return Err(GhccError::UpdateMismatch(changes));
        }

        debug!(owner, name, num_binaries, "Stored build results");
        Ok(())
    }

    /// Aggregate counts over all records.
    pub fn stats(&self) -> Result<StoreStats> {
        let stats = self.conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(clone_successful), 0),
                   COALESCE(SUM(compiled), 0),
                   COALESCE(SUM(num_makefiles), 0),
                   COALESCE(SUM(num_binaries), 0)
            FROM repos
            "#,
            [],
            |row| {
                Ok(StoreStats {
                    repos: row.get::<_, i64>(0)? as usize,
                    cloned: row.get::<_, i64>(1)? as usize,
                    compiled: row.get::<_, i64>(2)? as usize,
                    makefiles: row.get::<_, i64>(3)? as usize,
                    binaries: row.get::<_, i64>(4)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    /// Delete every record. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM repos", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open_path(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn entry(dir: &str, binaries: &[&str]) -> BuildDirectoryResult {
        BuildDirectoryResult::new(
            dir,
            binaries
                .iter()
                .map(|b| (PathBuf::from(b), format!("sha-{}", b)))
                .collect(),
        )
    }

    #[test]
    fn test_open_creates_schema() {
        let (_dir, store) = open_temp();
        let table_count: i32 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('meta', 'repos')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 2);
        assert_eq!(
            store.get_meta("schema_version").unwrap(),
            Some(SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn test_open_rejects_directory() {
        let dir = tempdir().unwrap();
        let result = Store::open_path(dir.path());
        assert!(matches!(result, Err(GhccError::InvalidPath(_))));
    }

    #[test]
    fn test_add_repo_is_idempotent() {
        let (_dir, store) = open_temp();
        let clone_time = DateTime::from_timestamp(1_700_000_000, 0);
        assert!(store.add_repo("o", "r", true, clone_time, 1024).unwrap());
        let first = store.get("o", "r").unwrap().unwrap();

        assert!(!store.add_repo("o", "r", false, None, 7).unwrap());
        let second = store.get("o", "r").unwrap().unwrap();

        assert_eq!(first, second);
        assert!(second.clone_successful);
        assert!(!second.compiled);
        assert_eq!(second.size_bytes, 1024);
        assert_eq!(second.clone_time, clone_time);
        assert!(second.makefiles.is_empty());
        assert_eq!(store.stats().unwrap().repos, 1);
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = open_temp();
        assert!(store.get("nobody", "nothing").unwrap().is_none());
    }

    #[test]
    fn test_update_build_results() {
        let (_dir, store) = open_temp();
        store.add_repo("o", "r", true, None, -1).unwrap();
        let results = vec![entry("", &["a.out"]), entry("src", &["x", "y"])];
        store.update_build_results("o", "r", &results).unwrap();

        let record = store.get("o", "r").unwrap().unwrap();
        assert!(record.compiled);
        assert_eq!(record.makefiles, results);
        assert_eq!(record.num_makefiles, 2);
        assert_eq!(record.num_binaries, 3);
    }

    #[test]
    fn test_update_rejects_different_length() {
        let (_dir, store) = open_temp();
        store.add_repo("o", "r", true, None, -1).unwrap();
        let x = entry("x", &["a.out"]);
        let y = entry("y", &["b.out"]);
        store.update_build_results("o", "r", std::slice::from_ref(&x)).unwrap();

        let result = store.update_build_results("o", "r", &[x.clone(), y]);
        assert!(matches!(
            result,
            Err(GhccError::Inconsistent {
                stored: 1,
                provided: 2,
                ..
            })
        ));
        assert_eq!(store.get("o", "r").unwrap().unwrap().makefiles, vec![x]);
    }

    #[test]
    fn test_update_same_length_is_allowed() {
        let (_dir, store) = open_temp();
        store.add_repo("o", "r", true, None, -1).unwrap();
        store
            .update_build_results("o", "r", &[entry("x", &["a"])])
            .unwrap();
        store
            .update_build_results("o", "r", &[entry("x", &["a", "b"])])
            .unwrap();
        assert_eq!(store.get("o", "r").unwrap().unwrap().num_binaries, 2);
    }

    #[test]
    fn test_update_empty_results_marks_compiled() {
        let (_dir, store) = open_temp();
        store.add_repo("o", "r", true, None, -1).unwrap();
        store.update_build_results("o", "r", &[]).unwrap();
        let record = store.get("o", "r").unwrap().unwrap();
        assert!(record.compiled);
        assert_eq!(record.num_makefiles, 0);
    }

    #[test]
    fn test_update_missing_repo() {
        let (_dir, store) = open_temp();
        let result = store.update_build_results("o", "missing", &[]);
        assert!(matches!(result, Err(GhccError::RepoNotFound { .. })));
    }

    #[test]
    fn test_stats_and_clear() {
        let (_dir, store) = open_temp();
        store.add_repo("a", "1", true, None, 10).unwrap();
        store.add_repo("a", "2", false, None, -1).unwrap();
        store
            .update_build_results("a", "1", &[entry("", &["p", "q"])])
            .unwrap();

        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                repos: 2,
                cloned: 1,
                compiled: 1,
                makefiles: 1,
                binaries: 2,
            }
        );
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_store_persists_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/test.db");
        {
            let store = Store::open_path(&path).unwrap();
            store.add_repo("o", "r", true, None, 5).unwrap();
        }
        let store = Store::open_path(&path).unwrap();
        assert_eq!(store.get("o", "r").unwrap().unwrap().size_bytes, 5);
    }
}
