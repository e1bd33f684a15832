use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tandem_core::{DocUpdate, DocumentIdentity};
use thiserror::Error;

pub const REPLICA_CACHE_SCHEMA_VERSION: i64 = 1;
pub const EPOCH_LEDGER_SCHEMA_VERSION: i64 = 2;

/// How long a writer waits for other connections to release the database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("database is locked by another connection")]
    Busy,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StorageError::Busy,
            _ => StorageError::Sqlite(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
    pub doc_key: String,
    pub epoch: u32,
    pub update_count: u64,
}

fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn apply_migrations(
    conn: &Connection,
    supported: i64,
    steps: &[(i64, &str)],
) -> Result<(), StorageError> {
    let current = schema_version(conn)?;
    if current > supported {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported,
        });
    }
    for (version, sql) in steps {
        if current < *version {
            conn.execute_batch(sql)?;
            conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
        }
    }
    Ok(())
}

/// Durable local replica storage. One logical document (`namespace:key`)
/// occupies one cache namespace; rows also carry the epoch they were written
/// under so a replica opened at a newer epoch starts empty.
pub struct ReplicaCache {
    conn: Connection,
}

impl ReplicaCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema_version(&self.conn)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        apply_migrations(
            &self.conn,
            REPLICA_CACHE_SCHEMA_VERSION,
            &[(
                1,
                include_str!("../migrations/replica_cache/0001_replica_cache.sql"),
            )],
        )
    }

    /// Registers the replica and returns every update stored for it.
    pub fn open_document(
        &self,
        identity: &DocumentIdentity,
    ) -> Result<Vec<DocUpdate>, StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO replica_documents (doc_key, epoch, opened_at) VALUES (?1, ?2, ?3)",
            params![identity.doc_key(), identity.epoch(), Utc::now().to_rfc3339()],
        )?;
        self.load_updates(identity)
    }

    pub fn load_updates(&self, identity: &DocumentIdentity) -> Result<Vec<DocUpdate>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT update_id, origin, ts_ms, body_json
            FROM replica_updates
            WHERE doc_key = ?1 AND epoch = ?2
            ORDER BY ts_ms ASC, update_id ASC
            ",
        )?;
        let rows = stmt.query_map(params![identity.doc_key(), identity.epoch()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (id, origin, ts_ms, body_json) = row?;
            let body = serde_json::from_str(&body_json)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            updates.push(DocUpdate {
                id,
                origin,
                ts_ms,
                body,
            });
        }
        Ok(updates)
    }

    /// Persists updates, ignoring ones already stored. Returns how many were new.
    pub fn store_updates(
        &mut self,
        identity: &DocumentIdentity,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let stored_at = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO replica_updates (
                    doc_key, epoch, update_id, origin, ts_ms, body_json, stored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for update in updates {
                let body_json = serde_json::to_string(&update.body)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                inserted += stmt.execute(params![
                    identity.doc_key(),
                    identity.epoch(),
                    update.id,
                    update.origin,
                    update.ts_ms,
                    body_json,
                    stored_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Removes everything cached for a logical document, at every epoch.
    /// Waits up to the busy timeout for other connections to let go.
    pub fn delete_document(&mut self, doc_key: &str) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM replica_updates WHERE doc_key = ?1",
            params![doc_key],
        )?;
        tx.execute(
            "DELETE FROM replica_documents WHERE doc_key = ?1",
            params![doc_key],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn documents(&self) -> Result<Vec<CachedDocument>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT d.doc_key, d.epoch, COUNT(u.update_id)
            FROM replica_documents d
            LEFT JOIN replica_updates u
                ON u.doc_key = d.doc_key AND u.epoch = d.epoch
            GROUP BY d.doc_key, d.epoch
            ORDER BY d.doc_key ASC, d.epoch ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CachedDocument {
                doc_key: row.get(0)?,
                epoch: row.get(1)?,
                update_count: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }
}

/// Persisted epoch bookkeeping: the process-wide current epoch, the
/// per-document reset attempt counters and the user turns already handed to
/// an agent. Lives in its own database file so a
/// locked replica cache never blocks the counters.
pub struct EpochLedger {
    conn: Connection,
}

impl EpochLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema_version(&self.conn)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        apply_migrations(
            &self.conn,
            EPOCH_LEDGER_SCHEMA_VERSION,
            &[
                (
                    1,
                    include_str!("../migrations/epoch_ledger/0001_epoch_ledger.sql"),
                ),
                (
                    2,
                    include_str!("../migrations/epoch_ledger/0002_dispatch_log.sql"),
                ),
            ],
        )
    }

    pub fn reset_attempts(&self, doc_key: &str) -> Result<u32, StorageError> {
        let attempts: Option<i64> = self
            .conn
            .query_row(
                "SELECT attempts FROM epoch_resets WHERE doc_key = ?1",
                params![doc_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0).max(0) as u32)
    }

    /// Increments and returns the new attempt count.
    pub fn increment_reset_attempts(&self, doc_key: &str) -> Result<u32, StorageError> {
        self.conn.execute(
            "
            INSERT INTO epoch_resets (doc_key, attempts, updated_at) VALUES (?1, 1, ?2)
            ON CONFLICT(doc_key) DO UPDATE SET
                attempts = attempts + 1,
                updated_at = excluded.updated_at
            ",
            params![doc_key, Utc::now().to_rfc3339()],
        )?;
        self.reset_attempts(doc_key)
    }

    pub fn clear_reset_attempts(&self, doc_key: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM epoch_resets WHERE doc_key = ?1",
            params![doc_key],
        )?;
        Ok(())
    }

    pub fn current_epoch(&self) -> Result<Option<u32>, StorageError> {
        let epoch: Option<i64> = self
            .conn
            .query_row(
                "SELECT current_epoch FROM epoch_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(epoch.and_then(|value| u32::try_from(value).ok()))
    }

    pub fn set_current_epoch(&self, epoch: u32) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO epoch_state (id, current_epoch, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                current_epoch = excluded.current_epoch,
                updated_at = excluded.updated_at
            ",
            params![epoch, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Records that `message_id` was dispatched. Returns false when it
    /// already was, so only the first caller runs the turn.
    pub fn record_dispatch(&self, doc_key: &str, message_id: &str) -> Result<bool, StorageError> {
        let inserted = self.conn.execute(
            "
            INSERT OR IGNORE INTO dispatched_messages (doc_key, message_id, dispatched_at)
            VALUES (?1, ?2, ?3)
            ",
            params![doc_key, message_id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn dispatch_count(&self, doc_key: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dispatched_messages WHERE doc_key = ?1",
            params![doc_key],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Role;

    fn identity(epoch: u32) -> DocumentIdentity {
        DocumentIdentity::build("task", "t1", epoch).expect("identity")
    }

    #[test]
    fn migration_sets_schema_version() {
        let cache = ReplicaCache::open_in_memory().expect("open cache");
        assert_eq!(
            cache.schema_version().expect("version"),
            REPLICA_CACHE_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.sqlite3");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch("PRAGMA user_version = 99").expect("bump");
        }
        match ReplicaCache::open(&path) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, REPLICA_CACHE_SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected schema version error"),
        }
    }

    #[test]
    fn updates_are_scoped_by_epoch() {
        let mut cache = ReplicaCache::open_in_memory().expect("open cache");
        let first = DocUpdate::message("daemon", Role::User, "hello");
        assert!(cache.open_document(&identity(2)).expect("open").is_empty());
        assert_eq!(
            cache.store_updates(&identity(2), &[first.clone()]).expect("store"),
            1
        );
        assert_eq!(
            cache.store_updates(&identity(2), &[first.clone()]).expect("store again"),
            0
        );

        assert_eq!(cache.load_updates(&identity(2)).expect("load"), vec![first]);
        assert!(cache.open_document(&identity(3)).expect("open newer").is_empty());
    }

    #[test]
    fn delete_clears_every_epoch_of_a_document() {
        let mut cache = ReplicaCache::open_in_memory().expect("open cache");
        let other = DocumentIdentity::build("task", "t2", 2).expect("identity");
        cache.open_document(&identity(2)).expect("open");
        cache.open_document(&identity(3)).expect("open");
        cache.open_document(&other).expect("open other");
        cache
            .store_updates(&identity(2), &[DocUpdate::message("a", Role::User, "x")])
            .expect("store");
        cache
            .store_updates(&identity(3), &[DocUpdate::message("a", Role::User, "y")])
            .expect("store");
        cache
            .store_updates(&other, &[DocUpdate::message("a", Role::User, "z")])
            .expect("store");

        assert_eq!(cache.delete_document("task:t1").expect("delete"), 2);
        assert!(cache.load_updates(&identity(2)).expect("load").is_empty());
        assert!(cache.load_updates(&identity(3)).expect("load").is_empty());
        assert_eq!(cache.load_updates(&other).expect("load").len(), 1);

        let documents = cache.documents().expect("documents");
        assert_eq!(
            documents,
            vec![CachedDocument {
                doc_key: "task:t2".to_string(),
                epoch: 2,
                update_count: 1,
            }]
        );
    }

    #[test]
    fn delete_waits_then_reports_busy_when_another_handle_holds_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replicas.sqlite3");
        let holder = ReplicaCache::open(&path).expect("open holder");
        holder
            .conn
            .execute_batch("BEGIN IMMEDIATE")
            .expect("hold write lock");

        let mut contender = ReplicaCache::open_with_busy_timeout(&path, Duration::from_millis(50))
            .expect("open contender");
        let started = std::time::Instant::now();
        let err = contender.delete_document("task:t1").unwrap_err();
        assert!(matches!(err, StorageError::Busy), "got {err}");
        assert!(started.elapsed() >= Duration::from_millis(40));

        holder.conn.execute_batch("ROLLBACK").expect("release");
        assert_eq!(contender.delete_document("task:t1").expect("delete"), 0);
    }

    #[test]
    fn ledger_counts_and_clears_attempts() {
        let ledger = EpochLedger::open_in_memory().expect("ledger");
        assert_eq!(ledger.reset_attempts("task:t1").expect("read"), 0);
        assert_eq!(ledger.increment_reset_attempts("task:t1").expect("inc"), 1);
        assert_eq!(ledger.increment_reset_attempts("task:t1").expect("inc"), 2);
        assert_eq!(ledger.reset_attempts("task:t2").expect("other"), 0);
        ledger.clear_reset_attempts("task:t1").expect("clear");
        assert_eq!(ledger.reset_attempts("task:t1").expect("read"), 0);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("epoch.sqlite3");
        {
            let ledger = EpochLedger::open(&path).expect("open");
            ledger.increment_reset_attempts("task:t1").expect("inc");
            ledger.set_current_epoch(5).expect("set epoch");
        }
        let ledger = EpochLedger::open(&path).expect("reopen");
        assert_eq!(ledger.reset_attempts("task:t1").expect("read"), 1);
        assert_eq!(ledger.current_epoch().expect("epoch"), Some(5));
    }

    #[test]
    fn dispatch_is_recorded_once_per_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("epoch.sqlite3");
        {
            let ledger = EpochLedger::open(&path).expect("open");
            assert!(ledger.record_dispatch("task:t1", "A").expect("record"));
            assert!(!ledger.record_dispatch("task:t1", "A").expect("record again"));
            assert!(ledger.record_dispatch("task:t2", "A").expect("other doc"));
        }
        let ledger = EpochLedger::open(&path).expect("reopen");
        assert_eq!(ledger.schema_version().expect("version"), EPOCH_LEDGER_SCHEMA_VERSION);
        assert!(!ledger.record_dispatch("task:t1", "A").expect("after reopen"));
        assert!(ledger.record_dispatch("task:t1", "B").expect("new turn"));
        assert_eq!(ledger.dispatch_count("task:t1").expect("count"), 2);
    }

    #[test]
    fn unusable_parent_directory_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("write");
        match ReplicaCache::open(blocker.join("replicas.sqlite3")) {
            Err(StorageError::Io(_)) => {}
            Err(other) => panic!("expected io error, got {other}"),
            Ok(_) => panic!("expected io error"),
        }
        assert!(matches!(
            EpochLedger::open(blocker.join("epochs.sqlite3")),
            Err(StorageError::Io(_))
        ));
    }
}
