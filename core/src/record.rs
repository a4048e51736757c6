//! Record types, the generic unit of sync.

use crate::{DataType, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The store that first produced a version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOrigin {
    /// The embedded local store
    Local,
    /// The external relational store
    External,
    /// The S3-compatible object store (never originates records; it is the
    /// identity of the object adapter as a sync destination)
    Object,
}

/// A replicated data record.
///
/// The payload is opaque to the core; adapters serialize it. Conflict
/// resolution only looks at `updated_at`, `origin`, `version`, and the
/// payload hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Data type this record belongs to
    pub data_type: DataType,
    /// Unique identifier within the data type
    pub id: RecordId,
    /// The actual data payload (JSON value, opaque to the core)
    pub payload: serde_json::Value,
    /// When the record was last updated (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Which store produced this version
    pub origin: StoreOrigin,
    /// Version number, incremented on each mutation
    pub version: Version,
}

impl Record {
    /// Create a new live record at version 1.
    pub fn new(
        data_type: DataType,
        id: impl Into<RecordId>,
        payload: serde_json::Value,
        updated_at: Timestamp,
        origin: StoreOrigin,
    ) -> Self {
        Self {
            data_type,
            id: id.into(),
            payload,
            updated_at,
            deleted: false,
            origin,
            version: 1,
        }
    }

    /// Check whether the record is live (not a tombstone).
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Mark the record as deleted (tombstone).
    pub fn mark_deleted(&mut self, at: Timestamp, origin: StoreOrigin) {
        self.deleted = true;
        self.version += 1;
        self.updated_at = at;
        self.origin = origin;
    }

    /// Replace the payload.
    pub fn update_payload(&mut self, payload: serde_json::Value, at: Timestamp, origin: StoreOrigin) {
        self.payload = payload;
        self.version += 1;
        self.updated_at = at;
        self.origin = origin;
    }

    /// Hex SHA-256 over the serialized payload, used as the final resolution
    /// tiebreak. `serde_json::Value` objects serialize with sorted keys, so
    /// the hash is deterministic.
    pub fn payload_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.update([self.deleted as u8]);
        hex::encode(hasher.finalize())
    }
}
