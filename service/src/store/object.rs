//! The S3-compatible object store adapter (R2).
//!
//! Two key spaces live in one bucket:
//! - `backups/<yyyymmdd_HHMMSS>/` for snapshot archives and manifests,
//!   driven by the snapshot engine through the raw byte operations;
//! - `sync/<type>/<yyyymmdd>/<id>/<version>.blob` for record-level
//!   backup-only sync, an append-only log of record versions.
//!
//! Every call goes through a token bucket so bursts cannot saturate the
//! provider.

use crate::config::R2Config;
use crate::error::{Result, SyncError};
use crate::store::ratelimit::TokenBucket;
use crate::store::{Page, StoreAdapter, StoreBatch};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flowsync_core::{ApplyOutcome, CursorToken, DataType, Record, Resolution, StoreOrigin, Timestamp};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use std::time::Duration;

/// Default sustained operation rate against the object store.
const DEFAULT_OPS_PER_SEC: f64 = 20.0;

/// Per-call budget; sized for snapshot archive uploads.
const OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Adapter over any `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreAdapter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    limiter: Arc<TokenBucket>,
}

impl ObjectStoreAdapter {
    /// Connect to an S3-compatible endpoint with R2 credentials.
    pub fn for_r2(config: &R2Config) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_region("auto")
            .build()
            .map_err(|e| SyncError::InvalidConfig {
                missing: vec![format!("R2: {e}")],
            })?;

        Ok(Self::with_store(Arc::new(store), config.bucket.clone()))
    }

    /// Wrap an already-built backend (in-memory in tests).
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self {
            store,
            bucket,
            limiter: Arc::new(TokenBucket::new(DEFAULT_OPS_PER_SEC)),
        }
    }

    /// Bucket name, recorded in backup manifests.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    // ---- raw byte operations (snapshot engine) -------------------------

    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.limiter.acquire().await;
        let path = ObjectPath::from(key);
        let put = self.store.put(&path, PutPayload::from(bytes));
        match tokio::time::timeout(OP_TIMEOUT, put).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(SyncError::Retryable(format!("object put of {key} timed out"))),
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.limiter.acquire().await;
        let get = async {
            match self.store.get(&ObjectPath::from(key)).await {
                Ok(result) => Ok(Some(result.bytes().await?.to_vec())),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            }
        };
        match tokio::time::timeout(OP_TIMEOUT, get).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Retryable(format!("object get of {key} timed out"))),
        }
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.limiter.acquire().await;
        let prefix = ObjectPath::from(prefix);
        let list = async {
            let mut keys = Vec::new();
            let mut stream = self.store.list(Some(&prefix));
            while let Some(meta) = stream.try_next().await? {
                keys.push(meta.location.to_string());
            }
            keys.sort();
            Ok(keys)
        };
        match tokio::time::timeout(OP_TIMEOUT, list).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Retryable("object listing timed out".into())),
        }
    }

    pub async fn delete_key(&self, key: &str) -> Result<()> {
        self.limiter.acquire().await;
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- record-level append-only log ----------------------------------

    /// Latest stored version of a record, if any.
    async fn latest_version(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        let keys = self.list_keys(&type_prefix(data_type)).await?;
        let best = keys
            .iter()
            .filter_map(|k| parse_record_key(k))
            .filter(|parsed| parsed.id == id)
            .max_by_key(|parsed| parsed.version);

        let Some(parsed) = best else {
            return Ok(None);
        };
        let Some(bytes) = self.get_bytes(&parsed.key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Internal(format!("corrupt record blob: {e}")))?;
        Ok(Some(record))
    }
}

#[async_trait]
impl StoreAdapter for ObjectStoreAdapter {
    fn origin(&self) -> StoreOrigin {
        StoreOrigin::Object
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        self.latest_version(data_type, id).await
    }

    async fn put(&self, record: &Record) -> Result<ApplyOutcome> {
        if let Some(current) = self.latest_version(record.data_type, &record.id).await? {
            match flowsync_core::resolve(record, &current) {
                Resolution::KeepCurrent => return Ok(ApplyOutcome::SkippedSuperseded),
                Resolution::Converged => return Ok(ApplyOutcome::AlreadyConverged),
                Resolution::KeepIncoming => {}
            }
        }

        let bytes = serde_json::to_vec(record).map_err(|e| SyncError::Internal(e.to_string()))?;
        self.put_bytes(&record_key(record), bytes).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn delete(&self, data_type: DataType, id: &str, at: Timestamp) -> Result<ApplyOutcome> {
        let record = match self.latest_version(data_type, id).await? {
            Some(mut record) => {
                if record.updated_at > at {
                    return Ok(ApplyOutcome::SkippedSuperseded);
                }
                record.mark_deleted(at, StoreOrigin::Object);
                record
            }
            None => {
                let mut record =
                    Record::new(data_type, id, serde_json::Value::Null, at, StoreOrigin::Object);
                record.deleted = true;
                record
            }
        };

        let bytes = serde_json::to_vec(&record).map_err(|e| SyncError::Internal(e.to_string()))?;
        self.put_bytes(&record_key(&record), bytes).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn list_since(
        &self,
        data_type: DataType,
        cursor: &CursorToken,
        limit: usize,
    ) -> Result<Page> {
        let keys = self.list_keys(&type_prefix(data_type)).await?;

        // Latest version per id; the log is append-only.
        let mut latest: std::collections::HashMap<String, ParsedKey> = std::collections::HashMap::new();
        for parsed in keys.iter().filter_map(|k| parse_record_key(k)) {
            let slot = latest.entry(parsed.id.clone()).or_insert_with(|| parsed.clone());
            if parsed.version > slot.version {
                *slot = parsed;
            }
        }

        let mut records = Vec::new();
        for parsed in latest.values() {
            let Some(bytes) = self.get_bytes(&parsed.key).await? else {
                continue;
            };
            let record: Record = serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Internal(format!("corrupt record blob: {e}")))?;
            let after_cursor = record.updated_at > cursor.updated_at
                || (record.updated_at == cursor.updated_at && record.id > cursor.last_id);
            if after_cursor {
                records.push(record);
            }
        }

        records.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        let has_more = records.len() > limit;
        records.truncate(limit);
        Ok(Page { records, has_more })
    }

    async fn ping(&self) -> Result<()> {
        self.limiter.acquire().await;
        self.store.list_with_delimiter(None).await?;
        Ok(())
    }

    async fn begin_batch(&self) -> Result<Box<dyn StoreBatch>> {
        Ok(Box::new(ObjectBatch {
            adapter: self.clone(),
            puts: Vec::new(),
        }))
    }
}

/// A buffered batch: the object store has no transactions, so writes are
/// staged and flushed sequentially on commit.
struct ObjectBatch {
    adapter: ObjectStoreAdapter,
    puts: Vec<Record>,
}

#[async_trait]
impl StoreBatch for ObjectBatch {
    async fn put(&mut self, record: &Record) -> Result<ApplyOutcome> {
        self.puts.push(record.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn delete(
        &mut self,
        data_type: DataType,
        id: &str,
        at: Timestamp,
    ) -> Result<ApplyOutcome> {
        let mut record = Record::new(data_type, id, serde_json::Value::Null, at, StoreOrigin::Object);
        record.deleted = true;
        self.puts.push(record);
        Ok(ApplyOutcome::Applied)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        for record in &self.puts {
            self.adapter.put(record).await?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ParsedKey {
    key: String,
    id: String,
    version: u64,
}

fn type_prefix(data_type: DataType) -> String {
    format!("sync/{}", data_type.as_str())
}

fn record_key(record: &Record) -> String {
    let date = Utc
        .timestamp_millis_opt(record.updated_at as i64)
        .single()
        .map(|t| t.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string());
    format!(
        "sync/{}/{}/{}/{}.blob",
        record.data_type.as_str(),
        date,
        record.id,
        record.version
    )
}

fn parse_record_key(key: &str) -> Option<ParsedKey> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        ["sync", _type, _date, id, file] => {
            let version = file.strip_suffix(".blob")?.parse().ok()?;
            Some(ParsedKey {
                key: key.to_string(),
                id: (*id).to_string(),
                version,
            })
        }
        _ => None,
    }
}
