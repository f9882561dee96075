//! Soft file locks
//!
//! Advisory locks keyed by file: at most one holder per file, refresh on
//! re-acquire by the same holder, takeover only after expiry. The in-memory
//! map is authoritative and carries the runtime connection binding; rows
//! are mirrored to the store without it so a restart can restore holders.

use crate::config::LOCK_EXPIRY_MS;
use crate::core::error::Result;
use crate::protocol::{LockState, LockType};
use crate::storage::Database;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A live lock plus the connection that holds it (never persisted).
#[derive(Clone, Debug)]
struct LockEntry {
    state: LockState,
    conn: Option<Uuid>,
}

/// Result of attempting to acquire a lock.
#[derive(Clone, Debug)]
pub enum AcquireResult {
    /// Lock installed or refreshed.
    Acquired(LockState),
    /// A different holder's unexpired lock is in the way.
    Denied { existing: LockState },
}

impl AcquireResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireResult::Acquired(_))
    }
}

/// Shared lock table for all files of the project.
pub struct LockTable {
    db: Arc<Database>,
    locks: RwLock<HashMap<String, LockEntry>>,
}

impl LockTable {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: RwLock::new(HashMap::new()),
        }
    }

    fn expired(state: &LockState, now_ms: i64) -> bool {
        now_ms - state.since >= LOCK_EXPIRY_MS
    }

    /// Load persisted locks at startup, dropping any already expired.
    /// Restored locks carry no connection binding.
    pub async fn restore_from_store(&self, now_ms: i64) -> Result<usize> {
        let mut locks = self.locks.write().await;
        let mut restored = 0;
        for state in self.db.all_locks()? {
            if Self::expired(&state, now_ms) {
                let _ = self.db.remove_lock(&state.file);
                continue;
            }
            locks.insert(
                state.file.clone(),
                LockEntry { state, conn: None },
            );
            restored += 1;
        }
        tracing::info!("Restored {} persisted locks", restored);
        Ok(restored)
    }

    /// Acquire or refresh a lock.
    pub async fn acquire(
        &self,
        file: &str,
        holder: &str,
        lock_type: LockType,
        conn: Option<Uuid>,
        now_ms: i64,
    ) -> Result<AcquireResult> {
        let mut locks = self.locks.write().await;

        if let Some(existing) = locks.get(file) {
            if existing.state.locked_by == holder {
                // Same holder refreshes in place.
            } else if !Self::expired(&existing.state, now_ms) {
                return Ok(AcquireResult::Denied {
                    existing: existing.state.clone(),
                });
            }
            // Expired lock by someone else: silent takeover.
        }

        let state = LockState {
            file: file.to_string(),
            locked_by: holder.to_string(),
            lock_type,
            since: now_ms,
        };
        self.db.put_lock(&state)?;
        locks.insert(
            file.to_string(),
            LockEntry {
                state: state.clone(),
                conn,
            },
        );
        Ok(AcquireResult::Acquired(state))
    }

    /// Release a lock. With a holder given, only that holder's lock is
    /// removed; a mismatch returns false. Absent locks are a no-op.
    pub async fn release(&self, file: &str, holder: Option<&str>) -> Result<bool> {
        let mut locks = self.locks.write().await;
        match locks.get(file) {
            None => Ok(false),
            Some(entry) => {
                if let Some(holder) = holder {
                    if entry.state.locked_by != holder {
                        return Ok(false);
                    }
                }
                locks.remove(file);
                self.db.remove_lock(file)?;
                Ok(true)
            }
        }
    }

    /// Release every lock held by a departing client, matched by holder
    /// name or by the runtime connection binding. Returns the freed files.
    pub async fn release_for_client(
        &self,
        holder: Option<&str>,
        conn: Option<Uuid>,
    ) -> Result<Vec<String>> {
        let mut locks = self.locks.write().await;
        let files: Vec<String> = locks
            .iter()
            .filter(|(_, entry)| {
                holder.is_some_and(|h| entry.state.locked_by == h)
                    || (conn.is_some() && entry.conn == conn)
            })
            .map(|(file, _)| file.clone())
            .collect();
        for file in &files {
            locks.remove(file);
            self.db.remove_lock(file)?;
        }
        Ok(files)
    }

    /// Current lock on a file, expired entries filtered out.
    pub async fn get(&self, file: &str, now_ms: i64) -> Option<LockState> {
        let locks = self.locks.read().await;
        locks
            .get(file)
            .filter(|e| !Self::expired(&e.state, now_ms))
            .map(|e| e.state.clone())
    }

    /// Snapshot of all live locks.
    pub async fn get_all(&self, now_ms: i64) -> Vec<LockState> {
        let locks = self.locks.read().await;
        locks
            .values()
            .filter(|e| !Self::expired(&e.state, now_ms))
            .map(|e| e.state.clone())
            .collect()
    }

    /// Drop every expired lock. Returns the freed files so the caller can
    /// broadcast a lock change when any were removed.
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<Vec<String>> {
        let mut locks = self.locks.write().await;
        let files: Vec<String> = locks
            .iter()
            .filter(|(_, e)| Self::expired(&e.state, now_ms))
            .map(|(file, _)| file.clone())
            .collect();
        for file in &files {
            locks.remove(file);
            self.db.remove_lock(file)?;
        }
        if !files.is_empty() {
            tracing::debug!("Swept {} expired locks", files.len());
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table() -> (TempDir, LockTable) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("partsync.db")).unwrap());
        (dir, LockTable::new(db))
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (_dir, table) = table();
        let result = table
            .acquire("a.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();
        assert!(result.is_acquired());
        assert!(table.get("a.txt", 1).await.is_some());

        assert!(table.release("a.txt", Some("alice")).await.unwrap());
        assert!(table.get("a.txt", 1).await.is_none());
    }

    #[tokio::test]
    async fn test_unexpired_lock_denies_other_holder() {
        let (_dir, table) = table();
        table
            .acquire("a.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();

        let result = table
            .acquire("a.txt", "bob", LockType::Editing, None, LOCK_EXPIRY_MS - 1)
            .await
            .unwrap();
        match result {
            AcquireResult::Denied { existing } => assert_eq!(existing.locked_by, "alice"),
            AcquireResult::Acquired(_) => panic!("expected denial"),
        }
        // Denial does not mutate the table.
        assert_eq!(table.get("a.txt", 1).await.unwrap().locked_by, "alice");
    }

    #[tokio::test]
    async fn test_takeover_after_expiry() {
        let (_dir, table) = table();
        table
            .acquire("a.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();

        let result = table
            .acquire("a.txt", "bob", LockType::Editing, None, LOCK_EXPIRY_MS)
            .await
            .unwrap();
        assert!(result.is_acquired());
        assert_eq!(
            table.get("a.txt", LOCK_EXPIRY_MS + 1).await.unwrap().locked_by,
            "bob"
        );
    }

    #[tokio::test]
    async fn test_same_holder_refreshes_since() {
        let (_dir, table) = table();
        table
            .acquire("a.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();
        table
            .acquire("a.txt", "alice", LockType::AgentWriting, None, 500)
            .await
            .unwrap();

        let lock = table.get("a.txt", 501).await.unwrap();
        assert_eq!(lock.since, 500);
        assert_eq!(lock.lock_type, LockType::AgentWriting);
    }

    #[tokio::test]
    async fn test_release_wrong_holder_fails() {
        let (_dir, table) = table();
        table
            .acquire("a.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();
        assert!(!table.release("a.txt", Some("bob")).await.unwrap());
        assert!(table.get("a.txt", 1).await.is_some());
        // Missing file is a quiet no-op.
        assert!(!table.release("ghost.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_for_client_by_conn_and_holder() {
        let (_dir, table) = table();
        let conn = Uuid::new_v4();
        table
            .acquire("a.txt", "alice", LockType::Editing, Some(conn), 0)
            .await
            .unwrap();
        table
            .acquire("b.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();
        table
            .acquire("c.txt", "bob", LockType::Editing, Some(Uuid::new_v4()), 0)
            .await
            .unwrap();

        let mut freed = table
            .release_for_client(Some("alice"), Some(conn))
            .await
            .unwrap();
        freed.sort();
        assert_eq!(freed, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert!(table.get("c.txt", 1).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_and_restore() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("partsync.db")).unwrap());
        let table = LockTable::new(db.clone());
        table
            .acquire("old.txt", "alice", LockType::Editing, None, 0)
            .await
            .unwrap();
        table
            .acquire("new.txt", "bob", LockType::Editing, None, LOCK_EXPIRY_MS)
            .await
            .unwrap();

        let swept = table.sweep_expired(LOCK_EXPIRY_MS).await.unwrap();
        assert_eq!(swept, vec!["old.txt".to_string()]);

        // A fresh table restores only what is persisted and unexpired.
        let fresh = LockTable::new(db);
        let restored = fresh.restore_from_store(LOCK_EXPIRY_MS + 1).await.unwrap();
        assert_eq!(restored, 1);
        assert!(fresh.get("new.txt", LOCK_EXPIRY_MS + 2).await.is_some());
    }
}
