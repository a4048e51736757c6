//! The external relational peer, reached over the network.
//!
//! Connections are pooled and every statement is parameterized. Transient
//! disconnects surface as `Retryable` through the error classification in
//! [`crate::error`]. Payloads of sensitive data types are encrypted before
//! they leave the process and decrypted on the way back in.

use crate::crypto::PayloadCipher;
use crate::error::{Result, SyncError};
use crate::store::{Page, StoreAdapter, StoreBatch};
use async_trait::async_trait;
use flowsync_core::{ApplyOutcome, CursorToken, DataType, Record, StoreOrigin, Timestamp};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

/// The external store adapter.
pub struct ExternalStore {
    pool: PgPool,
    cipher: Option<Arc<PayloadCipher>>,
    sensitive: HashSet<DataType>,
}

impl ExternalStore {
    /// Create the adapter. The pool connects lazily, so construction
    /// succeeds even while the peer is down; reachability is the detector's
    /// concern.
    pub fn connect(
        database_url: &str,
        max_connections: u32,
        cipher: Option<Arc<PayloadCipher>>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;

        Ok(Self {
            pool,
            cipher,
            sensitive: crate::config::sensitive_types().into_iter().collect(),
        })
    }

    /// Apply schema migrations. Called once the peer is known reachable.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Retryable(e.to_string()))?;
        Ok(())
    }

    /// Number of live records of a type, used by transition verification.
    pub async fn count_live(&self, data_type: DataType) -> Result<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM records WHERE data_type = $1 AND deleted = FALSE")
                .bind(data_type.as_str())
                .fetch_one(&self.pool)
                .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    fn seal(&self, record: &Record) -> Result<serde_json::Value> {
        if !self.sensitive.contains(&record.data_type) {
            return Ok(record.payload.clone());
        }
        match &self.cipher {
            Some(cipher) => cipher.seal_payload(&record.payload),
            None => Err(SyncError::Internal(format!(
                "no encryption key configured for sensitive type {}",
                record.data_type
            ))),
        }
    }

    fn open(&self, data_type: DataType, payload: serde_json::Value) -> Result<serde_json::Value> {
        if !self.sensitive.contains(&data_type) {
            return Ok(payload);
        }
        match &self.cipher {
            Some(cipher) => cipher.open_payload(&payload),
            None => Err(SyncError::Internal(format!(
                "no encryption key configured for sensitive type {data_type}"
            ))),
        }
    }

    fn record_from_row(&self, row: &PgRow) -> Result<Record> {
        let data_type: String = row.try_get("data_type")?;
        let data_type = DataType::from_str(&data_type)?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let origin: String = row.try_get("origin")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        let version: i64 = row.try_get("version")?;

        Ok(Record {
            data_type,
            id: row.try_get("id")?,
            payload: self.open(data_type, payload)?,
            updated_at: updated_at as u64,
            deleted: row.try_get("deleted")?,
            origin: parse_origin(&origin)?,
            version: version as u64,
        })
    }
}

#[async_trait]
impl StoreAdapter for ExternalStore {
    fn origin(&self) -> StoreOrigin {
        StoreOrigin::External
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            r#"
            SELECT data_type, id, payload, updated_at, deleted, origin, version
            FROM records
            WHERE data_type = $1 AND id = $2
            "#,
        )
        .bind(data_type.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.record_from_row(&row)).transpose()
    }

    async fn put(&self, record: &Record) -> Result<ApplyOutcome> {
        let payload = self.seal(record)?;
        let mut conn = self.pool.acquire().await?;
        upsert_guarded(&mut conn, record, &payload).await
    }

    async fn delete(&self, data_type: DataType, id: &str, at: Timestamp) -> Result<ApplyOutcome> {
        let existing = self.get(data_type, id).await?;
        let record = match existing {
            Some(mut record) => {
                if record.updated_at > at {
                    return Ok(ApplyOutcome::SkippedSuperseded);
                }
                record.mark_deleted(at, StoreOrigin::External);
                record
            }
            None => {
                let mut record =
                    Record::new(data_type, id, serde_json::Value::Null, at, StoreOrigin::External);
                record.deleted = true;
                record
            }
        };
        self.put(&record).await
    }

    async fn list_since(
        &self,
        data_type: DataType,
        cursor: &CursorToken,
        limit: usize,
    ) -> Result<Page> {
        let rows = sqlx::query(
            r#"
            SELECT data_type, id, payload, updated_at, deleted, origin, version
            FROM records
            WHERE data_type = $1 AND (updated_at, id) > ($2, $3)
            ORDER BY updated_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(data_type.as_str())
        .bind(cursor.updated_at as i64)
        .bind(&cursor.last_id)
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > limit;
        let records = rows
            .iter()
            .take(limit)
            .map(|row| self.record_from_row(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { records, has_more })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin_batch(&self) -> Result<Box<dyn StoreBatch>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(ExternalBatch {
            tx,
            cipher: self.cipher.clone(),
            sensitive: self.sensitive.clone(),
        }))
    }
}

/// An atomic batch of writes against the external store.
struct ExternalBatch {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    cipher: Option<Arc<PayloadCipher>>,
    sensitive: HashSet<DataType>,
}

impl ExternalBatch {
    fn seal(&self, record: &Record) -> Result<serde_json::Value> {
        if !self.sensitive.contains(&record.data_type) {
            return Ok(record.payload.clone());
        }
        match &self.cipher {
            Some(cipher) => cipher.seal_payload(&record.payload),
            None => Err(SyncError::Internal(format!(
                "no encryption key configured for sensitive type {}",
                record.data_type
            ))),
        }
    }
}

#[async_trait]
impl StoreBatch for ExternalBatch {
    async fn put(&mut self, record: &Record) -> Result<ApplyOutcome> {
        let payload = self.seal(record)?;
        upsert_guarded(&mut self.tx, record, &payload).await
    }

    async fn delete(
        &mut self,
        data_type: DataType,
        id: &str,
        at: Timestamp,
    ) -> Result<ApplyOutcome> {
        let mut record = Record::new(data_type, id, serde_json::Value::Null, at, StoreOrigin::External);
        record.deleted = true;
        let payload = self.seal(&record)?;
        upsert_guarded(&mut self.tx, &record, &payload).await
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
async fn upsert_guarded(
    conn: &mut PgConnection,
    record: &Record,
    payload: &serde_json::Value,
) -> Result<ApplyOutcome> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (data_type, id, payload, updated_at, deleted, origin, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (data_type, id) DO UPDATE SET
            payload = EXCLUDED.payload,
            updated_at = EXCLUDED.updated_at,
            deleted = EXCLUDED.deleted,
            origin = EXCLUDED.origin,
            version = EXCLUDED.version
        WHERE EXCLUDED.updated_at >= records.updated_at
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

fn origin_str(origin: StoreOrigin) -> &'static str {
    match origin {
        StoreOrigin::Local => "local",
        StoreOrigin::External => "external",
        StoreOrigin::Object => "object",
    }
}

fn parse_origin(s: &str) -> Result<StoreOrigin> {
    match s {
        "local" => Ok(StoreOrigin::Local),
        "external" => Ok(StoreOrigin::External),
        "object" => Ok(StoreOrigin::Object),
        other => Err(SyncError::Internal(format!("unknown origin: {other}"))),
    }
}
