//! Store adapters: a uniform CRUD + change-feed surface over the local
//! embedded store, the external relational store, and the object store.
//!
//! Contract shared by all adapters:
//! - operations are idempotent on identical inputs;
//! - `put` of a record with a stale `updated_at` relative to the stored copy
//!   leaves the stored copy intact and reports `SkippedSuperseded`;
//! - `list_since` pages by `(updated_at, id)` keyset, strictly after the
//!   cursor position, ordered ascending.

pub mod external;
pub mod local;
pub mod object;
pub mod ratelimit;

pub use external::ExternalStore;
pub use local::LocalStore;
pub use object::ObjectStoreAdapter;

use crate::error::Result;
use async_trait::async_trait;
use flowsync_core::{ApplyOutcome, CursorToken, DataType, Record, StoreOrigin, Timestamp};

/// One page of a store's change feed.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records ordered by `(updated_at, id)` ascending.
    pub records: Vec<Record>,
    /// Whether more records follow this page.
    pub has_more: bool,
}

/// The uniform capability set of every store.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Identity of this store, used as the `origin` of versions it produces.
    fn origin(&self) -> StoreOrigin;

    /// Fetch a record by `(type, id)`, tombstones included.
    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>>;

    /// Apply a record version. A stale `updated_at` leaves the stored copy
    /// intact and reports `SkippedSuperseded`.
    async fn put(&self, record: &Record) -> Result<ApplyOutcome>;

    /// Tombstone a record at `at`. Applying a delete to a missing record
    /// creates the tombstone so the deletion still propagates.
    async fn delete(&self, data_type: DataType, id: &str, at: Timestamp) -> Result<ApplyOutcome>;

    /// Page the change feed strictly after `cursor`.
    async fn list_since(
        &self,
        data_type: DataType,
        cursor: &CursorToken,
        limit: usize,
    ) -> Result<Page>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    /// Start an atomic batch of writes.
    async fn begin_batch(&self) -> Result<Box<dyn StoreBatch>>;
}

/// An in-progress atomic batch. Dropping without commit discards it.
#[async_trait]
pub trait StoreBatch: Send {
    async fn put(&mut self, record: &Record) -> Result<ApplyOutcome>;

    async fn delete(&mut self, data_type: DataType, id: &str, at: Timestamp)
        -> Result<ApplyOutcome>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
