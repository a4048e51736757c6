//! Shared test doubles for integration tests.

use async_trait::async_trait;
use flowsync_core::{ApplyOutcome, CursorToken, DataType, Record, StoreOrigin, Timestamp};
use flowsync_service::error::{Result, SyncError};
use flowsync_service::store::{Page, StoreAdapter, StoreBatch};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// An in-memory store with the full adapter contract, plus switches to
/// simulate unreachability and failing writes.
#[derive(Clone)]
pub struct MemoryAdapter {
    origin: StoreOrigin,
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<BTreeMap<(DataType, String), Record>>,
    unreachable: AtomicBool,
    failing_put_ids: Mutex<HashSet<String>>,
}

impl MemoryAdapter {
    pub fn new(origin: StoreOrigin) -> Self {
        Self {
            origin,
            inner: Arc::new(Inner {
                records: Mutex::new(BTreeMap::new()),
                unreachable: AtomicBool::new(false),
                failing_put_ids: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make puts of one record id fail with a retryable error.
    pub fn fail_puts_of(&self, id: &str) {
        self.inner
            .failing_put_ids
            .lock()
            .unwrap()
            .insert(id.to_string());
    }

    pub fn clear_put_failures(&self) {
        self.inner.failing_put_ids.lock().unwrap().clear();
    }

    /// Insert bypassing the timestamp guard, for test setup.
    pub fn insert_raw(&self, record: Record) {
        self.inner
            .records
            .lock()
            .unwrap()
            .insert((record.data_type, record.id.clone()), record);
    }

    pub fn snapshot(&self, data_type: DataType) -> Vec<Record> {
        self.inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.data_type == data_type)
            .cloned()
            .collect()
    }

    pub fn live_ids(&self, data_type: DataType) -> Vec<String> {
        self.snapshot(data_type)
            .into_iter()
            .filter(|r| r.is_live())
            .map(|r| r.id)
            .collect()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            Err(SyncError::Retryable("peer unreachable (simulated)".into()))
        } else {
            Ok(())
        }
    }

    fn apply(&self, record: &Record) -> Result<ApplyOutcome> {
        self.check_reachable()?;
        if self
            .inner
            .failing_put_ids
            .lock()
            .unwrap()
            .contains(&record.id)
        {
            return Err(SyncError::Retryable(format!(
                "write of {} failed (simulated)",
                record.id
            )));
        }

        let mut records = self.inner.records.lock().unwrap();
        let key = (record.data_type, record.id.clone());
        if let Some(current) = records.get(&key) {
            if current.updated_at > record.updated_at {
                return Ok(ApplyOutcome::SkippedSuperseded);
            }
        }
        records.insert(key, record.clone());
        Ok(ApplyOutcome::Applied)
    }
}

#[async_trait]
impl StoreAdapter for MemoryAdapter {
    fn origin(&self) -> StoreOrigin {
        self.origin
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        self.check_reachable()?;
        Ok(self
            .inner
            .records
            .lock()
            .unwrap()
            .get(&(data_type, id.to_string()))
            .cloned())
    }

    async fn put(&self, record: &Record) -> Result<ApplyOutcome> {
        self.apply(record)
    }

    async fn delete(&self, data_type: DataType, id: &str, at: Timestamp) -> Result<ApplyOutcome> {
        self.check_reachable()?;
        let mut records = self.inner.records.lock().unwrap();
        let key = (data_type, id.to_string());
        match records.get_mut(&key) {
            Some(record) => {
                if record.updated_at > at {
                    return Ok(ApplyOutcome::SkippedSuperseded);
                }
                record.mark_deleted(at, self.origin);
            }
            None => {
                let mut record =
                    Record::new(data_type, id, serde_json::Value::Null, at, self.origin);
                record.deleted = true;
                records.insert(key, record);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn list_since(
        &self,
        data_type: DataType,
        cursor: &CursorToken,
        limit: usize,
    ) -> Result<Page> {
        self.check_reachable()?;
        let records = self.inner.records.lock().unwrap();
        let mut matching: Vec<Record> = records
            .values()
            .filter(|r| r.data_type == data_type)
            .filter(|r| {
                r.updated_at > cursor.updated_at
                    || (r.updated_at == cursor.updated_at && r.id > cursor.last_id)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        Ok(Page {
            records: matching,
            has_more,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn begin_batch(&self) -> Result<Box<dyn StoreBatch>> {
        self.check_reachable()?;
        Ok(Box::new(MemoryBatch {
            adapter: self.clone(),
            staged: Vec::new(),
        }))
    }
}

/// Buffered batch applied on commit.
struct MemoryBatch {
    adapter: MemoryAdapter,
    staged: Vec<Record>,
}

#[async_trait]
impl StoreBatch for MemoryBatch {
    async fn put(&mut self, record: &Record) -> Result<ApplyOutcome> {
        self.staged.push(record.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn delete(
        &mut self,
        data_type: DataType,
        id: &str,
        at: Timestamp,
    ) -> Result<ApplyOutcome> {
        let mut record = Record::new(
            data_type,
            id,
            serde_json::Value::Null,
            at,
            self.adapter.origin,
        );
        record.deleted = true;
        self.staged.push(record);
        Ok(ApplyOutcome::Applied)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        for record in &self.staged {
            self.adapter.apply(record)?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
