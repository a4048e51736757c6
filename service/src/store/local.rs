//! The embedded local store: a single SQLite file owning all records, the
//! sync cursors, and the transition log.
//!
//! The change feed is the `(data_type, updated_at, id)` index over the
//! records table. An advisory read barrier lets the snapshot engine quiesce
//! writers without stopping readers: writers hold the barrier shared, a
//! snapshot holds it exclusive.

use crate::error::{Result, SyncError};
use crate::store::{Page, StoreAdapter, StoreBatch};
use async_trait::async_trait;
use flowsync_core::{
    ApplyOutcome, CursorToken, DataType, Record, StoreOrigin, SyncDirection, Timestamp,
    TransitionRecord, TransitionStatus,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqliteConnection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};

/// The embedded single-file store.
pub struct LocalStore {
    pool: RwLock<SqlitePool>,
    path: PathBuf,
    barrier: Arc<RwLock<()>>,
    /// Tombstones younger than this are never purged, so deletions propagate
    /// before garbage collection.
    tombstone_retention_ms: u64,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub async fn connect(path: impl Into<PathBuf>, tombstone_retention_ms: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = open_pool(&path).await?;
        init_schema(&pool).await?;

        Ok(Self {
            pool: RwLock::new(pool),
            path,
            barrier: Arc::new(RwLock::new(())),
            tombstone_retention_ms,
        })
    }

    async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.path
    }

    /// Exclusive hold on the advisory barrier; blocks new writers for the
    /// guard's lifetime.
    pub async fn write_barrier(&self) -> RwLockWriteGuard<'_, ()> {
        self.barrier.write().await
    }

    /// Flush the WAL into the main database file so a file-level copy sees
    /// every committed write. Call under the write barrier.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Atomically replace the database file and reopen the pool. Used by
    /// restore; sync cursors are reset so the next cycle reconciles against
    /// peers from scratch.
    pub async fn replace_database(&self, contents: &[u8]) -> Result<()> {
        let _fence = self.barrier.write().await;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| SyncError::Internal("local store has no parent directory".into()))?;
        let staged = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(staged.path(), contents)?;

        {
            let mut slot = self.pool.write().await;
            slot.close().await;
            // WAL sidecars belong to the closed database.
            for suffix in ["-wal", "-shm"] {
                let mut side = self.path.as_os_str().to_owned();
                side.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(side));
            }
            staged
                .persist(&self.path)
                .map_err(|e| SyncError::Internal(format!("atomic swap failed: {}", e.error)))?;
            *slot = open_pool(&self.path).await?;
            init_schema(&slot).await?;
        }

        self.reset_cursors(None).await?;
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    // ---- cursors -------------------------------------------------------

    /// Load the cursor for one `(type, direction)` worker.
    pub async fn load_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
    ) -> Result<Option<CursorToken>> {
        let pool = self.pool().await;
        let row = sqlx::query(
            "SELECT token FROM sync_cursors WHERE data_type = ?1 AND direction = ?2",
        )
        .bind(data_type.as_str())
        .bind(direction.as_str())
        .fetch_optional(&pool)
        .await?;

        match row {
            Some(row) => {
                let token: String = row.try_get("token")?;
                Ok(Some(CursorToken::parse(&token)?))
            }
            None => Ok(None),
        }
    }

    /// Persist a cursor position.
    pub async fn save_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        token: &CursorToken,
    ) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (data_type, direction, token)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (data_type, direction) DO UPDATE SET token = excluded.token
            "#,
        )
        .bind(data_type.as_str())
        .bind(direction.as_str())
        .bind(token.encode())
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// Drop cursors so the next cycle runs a full scan. `None` resets every
    /// type.
    pub async fn reset_cursors(&self, data_types: Option<&[DataType]>) -> Result<()> {
        let pool = self.pool().await;
        match data_types {
            None => {
                sqlx::query("DELETE FROM sync_cursors").execute(&pool).await?;
            }
            Some(types) => {
                for t in types {
                    sqlx::query("DELETE FROM sync_cursors WHERE data_type = ?1")
                        .bind(t.as_str())
                        .execute(&pool)
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ---- transition log ------------------------------------------------

    /// Append an immutable transition log entry.
    pub async fn append_transition(&self, record: &TransitionRecord) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query(
            r#"
            INSERT INTO transition_log (
                from_mode, to_mode, started_at, finished_at, status,
                reason, actor, error, snapshot_prefix
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(record.from_mode.as_str())
        .bind(record.to_mode.as_str())
        .bind(record.started_at as i64)
        .bind(record.finished_at.map(|t| t as i64))
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(&record.actor)
        .bind(record.error.as_deref())
        .bind(record.snapshot_prefix.as_deref())
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// The most recent transitions, newest first.
    pub async fn list_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"
            SELECT from_mode, to_mode, started_at, finished_at, status,
                   reason, actor, error, snapshot_prefix
            FROM transition_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&pool)
        .await?;

        rows.iter().map(transition_from_row).collect()
    }

    // ---- maintenance ---------------------------------------------------

    /// Purge tombstones older than the retention window.
    pub async fn purge_tombstones(&self, now: Timestamp) -> Result<u64> {
        let cutoff = now.saturating_sub(self.tombstone_retention_ms);
        let pool = self.pool().await;
        let result = sqlx::query("DELETE FROM records WHERE deleted = 1 AND updated_at < ?1")
            .bind(cutoff as i64)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of live (non-tombstoned) records of a type.
    pub async fn count_live(&self, data_type: DataType) -> Result<u64> {
        let pool = self.pool().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM records WHERE data_type = ?1 AND deleted = 0",
        )
        .bind(data_type.as_str())
        .fetch_one(&pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[async_trait]
impl StoreAdapter for LocalStore {
    fn origin(&self) -> StoreOrigin {
        StoreOrigin::Local
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        let pool = self.pool().await;
        let row = sqlx::query(
            r#"
            SELECT data_type, id, payload, updated_at, deleted, origin, version
            FROM records
            WHERE data_type = ?1 AND id = ?2
            "#,
        )
        .bind(data_type.as_str())
        .bind(id)
        .fetch_optional(&pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn put(&self, record: &Record) -> Result<ApplyOutcome> {
        let _writer = self.barrier.read().await;
        let pool = self.pool().await;
        let mut conn = pool.acquire().await?;
        upsert_guarded(&mut conn, record).await
    }

    async fn delete(&self, data_type: DataType, id: &str, at: Timestamp) -> Result<ApplyOutcome> {
        let _writer = self.barrier.read().await;
        let pool = self.pool().await;
        let mut conn = pool.acquire().await?;
        tombstone(&mut conn, data_type, id, at, StoreOrigin::Local).await
    }

    async fn list_since(
        &self,
        data_type: DataType,
        cursor: &CursorToken,
        limit: usize,
    ) -> Result<Page> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"
            SELECT data_type, id, payload, updated_at, deleted, origin, version
            FROM records
            WHERE data_type = ?1
              AND (updated_at > ?2 OR (updated_at = ?2 AND id > ?3))
            ORDER BY updated_at ASC, id ASC
            LIMIT ?4
            "#,
        )
        .bind(data_type.as_str())
        .bind(cursor.updated_at as i64)
        .bind(&cursor.last_id)
        .bind((limit + 1) as i64)
        .fetch_all(&pool)
        .await?;

        let has_more = rows.len() > limit;
        let records = rows
            .iter()
            .take(limit)
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { records, has_more })
    }

    async fn ping(&self) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn begin_batch(&self) -> Result<Box<dyn StoreBatch>> {
        let writer = self.barrier.clone().read_owned().await;
        let pool = self.pool().await;
        let tx = pool.begin().await?;
        Ok(Box::new(LocalBatch {
            tx,
            _writer: writer,
        }))
    }
}

/// An atomic batch of writes against the local store.
struct LocalBatch {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    _writer: tokio::sync::OwnedRwLockReadGuard<()>,
}

#[async_trait]
impl StoreBatch for LocalBatch {
    async fn put(&mut self, record: &Record) -> Result<ApplyOutcome> {
        upsert_guarded(&mut self.tx, record).await
    }

    async fn delete(
        &mut self,
        data_type: DataType,
        id: &str,
        at: Timestamp,
    ) -> Result<ApplyOutcome> {
        tombstone(&mut self.tx, data_type, id, at, StoreOrigin::Local).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Timestamp-guarded upsert: a stale write leaves the stored row intact.
async fn upsert_guarded(conn: &mut SqliteConnection, record: &Record) -> Result<ApplyOutcome> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| SyncError::Internal(e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT INTO records (data_type, id, payload, updated_at, deleted, origin, version)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (data_type, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            origin = excluded.origin,
            version = excluded.version
        WHERE excluded.updated_at >= records.updated_at
        "#,
    )
    .bind(record.data_type.as_str())
    .bind(&record.id)
    .bind(payload)
    .bind(record.updated_at as i64)
    .bind(record.deleted)
    .bind(origin_str(record.origin))
    .bind(record.version as i64)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        Ok(ApplyOutcome::SkippedSuperseded)
    } else {
        Ok(ApplyOutcome::Applied)
    }
}

/// Tombstone a record, creating the tombstone if the record never existed
/// locally so the deletion still propagates to peers.
async fn tombstone(
    conn: &mut SqliteConnection,
    data_type: DataType,
    id: &str,
    at: Timestamp,
    origin: StoreOrigin,
) -> Result<ApplyOutcome> {
    let existing = sqlx::query(
        r#"
        SELECT data_type, id, payload, updated_at, deleted, origin, version
        FROM records
        WHERE data_type = ?1 AND id = ?2
        "#,
    )
    .bind(data_type.as_str())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let record = match existing {
        Some(row) => {
            let mut record = record_from_row(&row)?;
            if record.updated_at > at {
                return Ok(ApplyOutcome::SkippedSuperseded);
            }
            record.mark_deleted(at, origin);
            record
        }
        None => {
            let mut record =
                Record::new(data_type, id, serde_json::Value::Null, at, origin);
            record.deleted = true;
            record
        }
    };

    upsert_guarded(conn, &record).await
}

fn origin_str(origin: StoreOrigin) -> &'static str {
    match origin {
        StoreOrigin::Local => "local",
        StoreOrigin::External => "external",
        StoreOrigin::Object => "object",
    }
}

fn origin_from_str(s: &str) -> Result<StoreOrigin> {
    match s {
        "local" => Ok(StoreOrigin::Local),
        "external" => Ok(StoreOrigin::External),
        "object" => Ok(StoreOrigin::Object),
        other => Err(SyncError::Internal(format!("unknown origin: {other}"))),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let data_type: String = row.try_get("data_type")?;
    let payload: String = row.try_get("payload")?;
    let origin: String = row.try_get("origin")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let version: i64 = row.try_get("version")?;

    Ok(Record {
        data_type: DataType::from_str(&data_type)?,
        id: row.try_get("id")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| SyncError::Internal(e.to_string()))?,
        updated_at: updated_at as u64,
        deleted: row.try_get("deleted")?,
        origin: origin_from_str(&origin)?,
        version: version as u64,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<TransitionRecord> {
    let from_mode: String = row.try_get("from_mode")?;
    let to_mode: String = row.try_get("to_mode")?;
    let status: String = row.try_get("status")?;
    let started_at: i64 = row.try_get("started_at")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;

    Ok(TransitionRecord {
        from_mode: from_mode.parse()?,
        to_mode: to_mode.parse()?,
        started_at: started_at as u64,
        finished_at: finished_at.map(|t| t as u64),
        status: TransitionStatus::parse(&status)
            .ok_or_else(|| SyncError::Internal(format!("unknown transition status: {status}")))?,
        reason: row.try_get("reason")?,
        actor: row.try_get("actor")?,
        error: row.try_get("error")?,
        snapshot_prefix: row.try_get("snapshot_prefix")?,
    })
}

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            data_type TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            origin TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (data_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_feed ON records (data_type, updated_at, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            data_type TEXT NOT NULL,
            direction TEXT NOT NULL,
            token TEXT NOT NULL,
            PRIMARY KEY (data_type, direction)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transition_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_mode TEXT NOT NULL,
            to_mode TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            reason TEXT NOT NULL,
            actor TEXT NOT NULL,
            error TEXT,
            snapshot_prefix TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_core::DeploymentMode;
    use serde_json::json;

    async fn store() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::connect(dir.path().join("flowsync.db"), 3_600_000)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (store, _dir) = store().await;
        let record = Record::new(
            DataType::Users,
            "alice",
            json!({"name": "Alice"}),
            1000,
            StoreOrigin::Local,
        );

        assert_eq!(store.put(&record).await.unwrap(), ApplyOutcome::Applied);

        let fetched = store.get(DataType::Users, "alice").await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.get(DataType::Users, "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_put_is_superseded() {
        let (store, _dir) = store().await;
        let mut record = Record::new(
            DataType::Projects,
            "p1",
            json!({"title": "new"}),
            2000,
            StoreOrigin::Local,
        );
        store.put(&record).await.unwrap();

        record.payload = json!({"title": "old"});
        record.updated_at = 1000;
        assert_eq!(
            store.put(&record).await.unwrap(),
            ApplyOutcome::SkippedSuperseded
        );

        let stored = store.get(DataType::Projects, "p1").await.unwrap().unwrap();
        assert_eq!(stored.payload, json!({"title": "new"}));
    }

    #[tokio::test]
    async fn delete_tombstones_and_guards() {
        let (store, _dir) = store().await;
        let record = Record::new(
            DataType::Users,
            "alice",
            json!({"name": "Alice"}),
            1000,
            StoreOrigin::Local,
        );
        store.put(&record).await.unwrap();

        assert_eq!(
            store.delete(DataType::Users, "alice", 2000).await.unwrap(),
            ApplyOutcome::Applied
        );
        let stored = store.get(DataType::Users, "alice").await.unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.updated_at, 2000);

        // A delete older than the stored copy is superseded.
        assert_eq!(
            store.delete(DataType::Users, "alice", 1500).await.unwrap(),
            ApplyOutcome::SkippedSuperseded
        );
    }

    #[tokio::test]
    async fn delete_of_missing_record_creates_tombstone() {
        let (store, _dir) = store().await;
        assert_eq!(
            store.delete(DataType::Users, "ghost", 1000).await.unwrap(),
            ApplyOutcome::Applied
        );
        let stored = store.get(DataType::Users, "ghost").await.unwrap().unwrap();
        assert!(stored.deleted);
    }

    #[tokio::test]
    async fn change_feed_pages_by_keyset() {
        let (store, _dir) = store().await;
        for (id, ts) in [("a", 100), ("b", 200), ("c", 200), ("d", 300)] {
            let record = Record::new(DataType::Projects, id, json!({}), ts, StoreOrigin::Local);
            store.put(&record).await.unwrap();
        }

        let page = store
            .list_since(DataType::Projects, &CursorToken::origin(), 2)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.records[0].id, "a");
        assert_eq!(page.records[1].id, "b");

        let mut cursor = CursorToken::origin();
        cursor.advance(200, "b");
        let page = store
            .list_since(DataType::Projects, &cursor, 10)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(!page.has_more);
        assert_eq!(page.records[0].id, "c");
        assert_eq!(page.records[1].id, "d");
    }

    #[tokio::test]
    async fn feed_is_scoped_per_type() {
        let (store, _dir) = store().await;
        store
            .put(&Record::new(DataType::Users, "u", json!({}), 100, StoreOrigin::Local))
            .await
            .unwrap();
        store
            .put(&Record::new(DataType::Projects, "p", json!({}), 100, StoreOrigin::Local))
            .await
            .unwrap();

        let page = store
            .list_since(DataType::Users, &CursorToken::origin(), 10)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "u");
    }

    #[tokio::test]
    async fn batch_commit_and_rollback() {
        let (store, _dir) = store().await;

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .put(&Record::new(DataType::Users, "a", json!({}), 100, StoreOrigin::Local))
            .await
            .unwrap();
        batch.commit().await.unwrap();
        assert!(store.get(DataType::Users, "a").await.unwrap().is_some());

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .put(&Record::new(DataType::Users, "b", json!({}), 100, StoreOrigin::Local))
            .await
            .unwrap();
        batch.rollback().await.unwrap();
        assert!(store.get(DataType::Users, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_persistence() {
        let (store, _dir) = store().await;
        assert!(store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap()
            .is_none());

        let mut token = CursorToken::origin();
        token.advance(1234, "alice");
        store
            .save_cursor(DataType::Users, SyncDirection::LocalToExternal, &token)
            .await
            .unwrap();

        let loaded = store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, token);

        store
            .reset_cursors(Some(&[DataType::Users]))
            .await
            .unwrap();
        assert!(store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transition_log_round_trip() {
        let (store, _dir) = store().await;
        let record = TransitionRecord::begin(
            DeploymentMode::LocalOnly,
            DeploymentMode::LocalExternal,
            1000,
            "promote",
            "test",
        )
        .finish(TransitionStatus::Succeeded, 2000, None);

        store.append_transition(&record).await.unwrap();

        let history = store.list_transitions(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], record);
    }

    #[tokio::test]
    async fn tombstone_purge_honors_retention() {
        let (store, _dir) = store().await;
        store
            .delete(DataType::Projects, "old", 1000)
            .await
            .unwrap();
        store
            .delete(DataType::Projects, "fresh", 9_000_000)
            .await
            .unwrap();

        // retention is 3_600_000 ms; now = 10_000_000 purges only "old"
        let purged = store.purge_tombstones(10_000_000).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(DataType::Projects, "old").await.unwrap().is_none());
        assert!(store
            .get(DataType::Projects, "fresh")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn replace_database_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowsync.db");

        // Build a donor database with one record.
        let donor_path = dir.path().join("donor.db");
        let donor = LocalStore::connect(&donor_path, 0).await.unwrap();
        donor
            .put(&Record::new(DataType::Users, "from-backup", json!({}), 1, StoreOrigin::Local))
            .await
            .unwrap();
        donor.checkpoint().await.unwrap();
        donor.close().await;
        let donor_bytes = std::fs::read(&donor_path).unwrap();

        let store = LocalStore::connect(&path, 0).await.unwrap();
        store
            .put(&Record::new(DataType::Users, "pre-restore", json!({}), 1, StoreOrigin::Local))
            .await
            .unwrap();
        store
            .save_cursor(
                DataType::Users,
                SyncDirection::LocalToExternal,
                &CursorToken { updated_at: 5, last_id: "x".into() },
            )
            .await
            .unwrap();

        store.replace_database(&donor_bytes).await.unwrap();

        assert!(store
            .get(DataType::Users, "from-backup")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(DataType::Users, "pre-restore")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn live_count() {
        let (store, _dir) = store().await;
        for id in ["a", "b", "c"] {
            store
                .put(&Record::new(DataType::Users, id, json!({}), 100, StoreOrigin::Local))
                .await
                .unwrap();
        }
        store.delete(DataType::Users, "c", 200).await.unwrap();
        assert_eq!(store.count_live(DataType::Users).await.unwrap(), 2);
    }
}
