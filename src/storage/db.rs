//! Persistent store for the relay
//!
//! Four tables on redb: the per-file diff chains, the current fingerprint
//! per file, the persisted soft locks, and the conflict log. Monotonic ids
//! come from a counter table bumped inside the same write transaction as
//! the row they number.

use crate::core::error::Result;
use crate::protocol::{ConflictEvent, FileDiff, FileVersion, LockState};
use redb::{Database as RedbDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};

// Table definitions
const DIFFS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("diffs");
const FILE_VERSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_versions");
const LOCKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
const CONFLICTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("conflicts");
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");

const DIFF_COUNTER: &str = "next_diff_id";
const CONFLICT_COUNTER: &str = "next_conflict_id";

/// Relay-side store. Owned by the relay process; clients never touch it.
pub struct Database {
    db: RedbDatabase,
    path: PathBuf,
}

impl Database {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = RedbDatabase::create(&path)?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DIFFS_TABLE)?;
            let _ = write_txn.open_table(FILE_VERSIONS_TABLE)?;
            let _ = write_txn.open_table(LOCKS_TABLE)?;
            let _ = write_txn.open_table(CONFLICTS_TABLE)?;
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db, path })
    }

    // ============================================================================
    // Diff chain
    // ============================================================================

    /// Append a diff, returning its store-assigned monotonic id. The stored
    /// row carries the id so re-broadcasts include it.
    pub fn insert_diff(&self, diff: &FileDiff) -> Result<i64> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut counters = write_txn.open_table(COUNTERS_TABLE)?;
            let id = counters.get(DIFF_COUNTER)?.map(|v| v.value()).unwrap_or(1);
            counters.insert(DIFF_COUNTER, id + 1)?;

            let mut stored = diff.clone();
            stored.id = Some(id as i64);
            let payload = serde_json::to_vec(&stored)?;

            let mut diffs = write_txn.open_table(DIFFS_TABLE)?;
            diffs.insert(id, payload.as_slice())?;
            id
        };
        write_txn.commit()?;
        Ok(id as i64)
    }

    /// Fetch one diff by id.
    pub fn diff_by_id(&self, id: i64) -> Result<Option<FileDiff>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DIFFS_TABLE)?;
        match table.get(id as u64)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Diffs for one file, newest first.
    pub fn diffs_by_file(&self, file: &str, limit: usize) -> Result<Vec<FileDiff>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DIFFS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()?.rev() {
            let (_, value) = entry?;
            let diff: FileDiff = serde_json::from_slice(value.value())?;
            if diff.file == file {
                out.push(diff);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Diffs a client with `version` is missing, oldest first: everything
    /// after the newest row whose `version` matches. Falls back to the full
    /// chain when no row matches (unknown or pre-history fingerprint).
    pub fn diffs_since(&self, file: &str, version: &str) -> Result<Vec<FileDiff>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DIFFS_TABLE)?;

        let mut chain = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let diff: FileDiff = serde_json::from_slice(value.value())?;
            if diff.file == file {
                chain.push(diff);
            }
        }
        let cut = chain
            .iter()
            .rposition(|d| d.version == version)
            .map(|at| at + 1)
            .unwrap_or(0);
        Ok(chain.split_off(cut))
    }

    /// Most recent diffs across all files, newest first.
    pub fn recent_diffs(&self, limit: usize) -> Result<Vec<FileDiff>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DIFFS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()?.rev() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Drop rows for `file` outside the newest `keep` by timestamp.
    pub fn prune(&self, file: &str, keep: usize) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(DIFFS_TABLE)?;

            let mut rows: Vec<(u64, i64)> = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let diff: FileDiff = serde_json::from_slice(value.value())?;
                if diff.file == file {
                    rows.push((key.value(), diff.timestamp));
                }
            }
            if rows.len() <= keep {
                0
            } else {
                // Oldest by timestamp go first; ties break toward lower ids.
                rows.sort_by_key(|(id, ts)| (*ts, *id));
                let excess = rows.len() - keep;
                for (id, _) in rows.iter().take(excess) {
                    table.remove(*id)?;
                }
                excess
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Total diff rows across all files.
    pub fn total_diffs(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DIFFS_TABLE)?;
        Ok(table.len()?)
    }

    // ============================================================================
    // File versions
    // ============================================================================

    /// Single-row replace of a file's current fingerprint.
    pub fn upsert_version(&self, file: &str, hash: &str, timestamp: i64) -> Result<()> {
        let row = FileVersion {
            file: file.to_string(),
            hash: hash.to_string(),
            timestamp,
        };
        let payload = serde_json::to_vec(&row)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FILE_VERSIONS_TABLE)?;
            table.insert(file, payload.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Current fingerprint for a file, if any.
    pub fn get_version(&self, file: &str) -> Result<Option<FileVersion>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_VERSIONS_TABLE)?;
        match table.get(file)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Every tracked file's current fingerprint.
    pub fn all_versions(&self) -> Result<Vec<FileVersion>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_VERSIONS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Count of tracked files.
    pub fn total_files(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_VERSIONS_TABLE)?;
        Ok(table.len()?)
    }

    // ============================================================================
    // Locks
    // ============================================================================

    /// Persist a lock row (no connection binding is stored).
    pub fn put_lock(&self, lock: &LockState) -> Result<()> {
        let payload = serde_json::to_vec(lock)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCKS_TABLE)?;
            table.insert(lock.file.as_str(), payload.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a persisted lock row.
    pub fn remove_lock(&self, file: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(LOCKS_TABLE)?;
            let existed = table.remove(file)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Load all persisted locks.
    pub fn all_locks(&self) -> Result<Vec<LockState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOCKS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // ============================================================================
    // Conflicts
    // ============================================================================

    /// Append a conflict record and return its id.
    pub fn insert_conflict(&self, event: &ConflictEvent) -> Result<i64> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut counters = write_txn.open_table(COUNTERS_TABLE)?;
            let id = counters
                .get(CONFLICT_COUNTER)?
                .map(|v| v.value())
                .unwrap_or(1);
            counters.insert(CONFLICT_COUNTER, id + 1)?;

            let mut stored = event.clone();
            stored.id = Some(id as i64);
            let payload = serde_json::to_vec(&stored)?;

            let mut table = write_txn.open_table(CONFLICTS_TABLE)?;
            table.insert(id, payload.as_slice())?;
            id
        };
        write_txn.commit()?;
        Ok(id as i64)
    }

    /// Most recent conflict records, newest first.
    pub fn recent_conflicts(&self, limit: usize) -> Result<Vec<ConflictEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFLICTS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()?.rev() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // ============================================================================
    // Health
    // ============================================================================

    /// On-disk size of the store file.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthorType, LockType};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("partsync.db")).unwrap();
        (dir, db)
    }

    fn diff(file: &str, ts: i64, prev: &str, ver: &str) -> FileDiff {
        FileDiff {
            id: None,
            file: file.into(),
            patch: format!("@@ -1 +1 @@\n-{prev}\n+{ver}\n"),
            author: "alice".into(),
            author_type: AuthorType::Human,
            timestamp: ts,
            version: ver.into(),
            previous_version: prev.into(),
            compressed: false,
        }
    }

    #[test]
    fn test_insert_assigns_monotonic_ids() {
        let (_dir, db) = open_temp();
        let a = db.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        let b = db.insert_diff(&diff("a.txt", 2, "v1", "v2")).unwrap();
        assert!(b > a);

        let stored = db.diff_by_id(a).unwrap().unwrap();
        assert_eq!(stored.id, Some(a));
        assert_eq!(stored.version, "v1");
    }

    #[test]
    fn test_diffs_by_file_newest_first() {
        let (_dir, db) = open_temp();
        db.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        db.insert_diff(&diff("b.txt", 2, "w0", "w1")).unwrap();
        db.insert_diff(&diff("a.txt", 3, "v1", "v2")).unwrap();

        let list = db.diffs_by_file("a.txt", 100).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].version, "v2");
        assert_eq!(list[1].version, "v1");
    }

    #[test]
    fn test_diffs_since_returns_tail() {
        let (_dir, db) = open_temp();
        db.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        db.insert_diff(&diff("a.txt", 2, "v1", "v2")).unwrap();
        db.insert_diff(&diff("a.txt", 3, "v2", "v3")).unwrap();

        let tail = db.diffs_since("a.txt", "v1").unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, "v2");
        assert_eq!(tail[1].version, "v3");

        // Unknown fingerprint falls back to the whole chain.
        let all = db.diffs_since("a.txt", "nope").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].version, "v1");

        // Up to date: nothing missing.
        assert!(db.diffs_since("a.txt", "v3").unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest_by_timestamp() {
        let (_dir, db) = open_temp();
        for i in 0..10 {
            db.insert_diff(&diff("a.txt", i, "p", &format!("v{i}"))).unwrap();
        }
        db.insert_diff(&diff("b.txt", 100, "q0", "q1")).unwrap();

        let removed = db.prune("a.txt", 4).unwrap();
        assert_eq!(removed, 6);

        let left = db.diffs_by_file("a.txt", 100).unwrap();
        assert_eq!(left.len(), 4);
        assert!(left.iter().all(|d| d.timestamp >= 6));
        // Other files untouched.
        assert_eq!(db.diffs_by_file("b.txt", 100).unwrap().len(), 1);
    }

    #[test]
    fn test_version_upsert_replaces() {
        let (_dir, db) = open_temp();
        db.upsert_version("a.txt", "h1", 1).unwrap();
        db.upsert_version("a.txt", "h2", 2).unwrap();

        let row = db.get_version("a.txt").unwrap().unwrap();
        assert_eq!(row.hash, "h2");
        assert_eq!(db.total_files().unwrap(), 1);
        assert_eq!(db.all_versions().unwrap().len(), 1);
    }

    #[test]
    fn test_lock_rows_round_trip() {
        let (_dir, db) = open_temp();
        let lock = LockState {
            file: "a.txt".into(),
            locked_by: "alice".into(),
            lock_type: LockType::Editing,
            since: 42,
        };
        db.put_lock(&lock).unwrap();
        assert_eq!(db.all_locks().unwrap(), vec![lock]);
        assert!(db.remove_lock("a.txt").unwrap());
        assert!(!db.remove_lock("a.txt").unwrap());
        assert!(db.all_locks().unwrap().is_empty());
    }

    #[test]
    fn test_conflict_log() {
        let (_dir, db) = open_temp();
        let event = ConflictEvent {
            id: None,
            file: "a.txt".into(),
            conflict_file: "a.conflict-5.txt".into(),
            author_a: "alice".into(),
            author_b: "bob".into(),
            timestamp: 5,
            resolved: false,
        };
        let id = db.insert_conflict(&event).unwrap();
        let recent = db.recent_conflicts(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, Some(id));
        assert_eq!(recent[0].author_b, "bob");
    }

    #[test]
    fn test_reopen_preserves_counter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partsync.db");
        let first = {
            let db = Database::open(&path).unwrap();
            db.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap()
        };
        let db = Database::open(&path).unwrap();
        let second = db.insert_diff(&diff("a.txt", 2, "v1", "v2")).unwrap();
        assert!(second > first);
    }
}
