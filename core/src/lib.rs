//! # FlowSync Core
//!
//! Deterministic domain logic for the FlowSync multi-tier data
//! synchronization core.
//!
//! This crate holds everything that can be computed without touching a
//! database, the network, or an object store: the record model, the
//! deployment-mode decision table, the per-data-type policy registry, the
//! conflict-resolution function, sync cursors, backup manifests, and the
//! transition log entries. The same inputs always produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: store adapters, workers, and schedulers live in
//!   `flowsync-service`; this crate only decides.
//! - **Deterministic**: conflict resolution is a total function over a pair
//!   of record versions ([`resolve::resolve`]).
//! - **Testable**: pure logic, no mocks needed.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Data is replicated as [`Record`]s: a typed id, an opaque JSON payload,
//! a millisecond `updated_at` stamp, a tombstone flag, the [`StoreOrigin`]
//! that produced the version, and a version counter.
//!
//! ### Deployment modes
//!
//! [`DeploymentMode`] captures which of the four store topologies is active.
//! It is derived from peer reachability, never stored authoritatively.
//!
//! ### Policies
//!
//! [`PolicyRegistry`] is the ground-truth table of per-data-type sync
//! behavior. [`PolicyRegistry::for_mode`] applies the mode-specific
//! overrides (e.g. the `LOCAL_R2` downgrade of non-critical duplex types to
//! backup-only).
//!
//! ### Resolution
//!
//! [`resolve::resolve`] merges two versions of a record deterministically:
//! newer `updated_at` wins; on ties an external-origin copy beats a local
//! one, then the higher version wins, then the lexicographically higher
//! payload hash.

pub mod clock;
pub mod cursor;
pub mod datatype;
pub mod error;
pub mod manifest;
pub mod mode;
pub mod policy;
pub mod record;
pub mod resolve;
pub mod transition;

// Re-export main types at crate root
pub use clock::MonotonicClock;
pub use cursor::{CursorToken, SyncCursor};
pub use datatype::DataType;
pub use error::{Error, Result};
pub use manifest::{BackupManifest, SnapshotComponents};
pub use mode::DeploymentMode;
pub use policy::{PolicyRegistry, SyncDirection, SyncPolicy, SyncStrategy};
pub use record::{Record, StoreOrigin};
pub use resolve::{resolve, ApplyOutcome, Resolution};
pub use transition::{TransitionRecord, TransitionStatus};

/// Type aliases for clarity
pub type RecordId = String;
pub type Timestamp = u64;
pub type Version = u64;
