//! Conflict resolution between two versions of a record.
//!
//! This is the core of determinism. Given two copies of the same record, the
//! resolution function is total and always returns the same winner, no
//! matter which store asks or in which direction a worker is pushing.
//!
//! # Algorithm
//!
//! 1. Newer `updated_at` wins.
//! 2. On tie, origin precedence: an external-origin copy beats a local one.
//!    Both stores apply the same precedence, so simultaneous same-stamp
//!    writes converge on the external value everywhere.
//! 3. On tie, higher `version` wins.
//! 4. On tie, lexicographically higher payload hash wins.
//! 5. Identical hashes mean the copies are equivalent; nothing to apply.
//!
//! Tombstones follow the same rules: a newer tombstone supersedes a live
//! record and vice versa.

use crate::{Record, StoreOrigin};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The winner of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Apply the incoming copy over the destination's.
    KeepIncoming,
    /// The destination's copy stands; the incoming one is superseded.
    KeepCurrent,
    /// The copies are equivalent; nothing to apply.
    Converged,
}

/// Per-record outcome of an apply attempt, reported by workers and batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Inserted or replaced without contest.
    Applied,
    /// The stored copy was newer; nothing changed.
    SkippedSuperseded,
    /// Both sides had changed; the resolution rules picked the incoming copy.
    ConflictResolved,
    /// Destination already held an equivalent copy.
    AlreadyConverged,
}

fn origin_rank(origin: StoreOrigin) -> u8 {
    match origin {
        StoreOrigin::External => 2,
        StoreOrigin::Local => 1,
        StoreOrigin::Object => 0,
    }
}

/// Resolve the incoming copy against the destination's current copy.
///
/// Never picks randomly: for any pair of versions the same winner is elected
/// on every call, and swapping the arguments never elects both.
pub fn resolve(incoming: &Record, current: &Record) -> Resolution {
    match incoming.updated_at.cmp(&current.updated_at) {
        Ordering::Greater => return Resolution::KeepIncoming,
        Ordering::Less => return Resolution::KeepCurrent,
        Ordering::Equal => {}
    }

    match origin_rank(incoming.origin).cmp(&origin_rank(current.origin)) {
        Ordering::Greater => return Resolution::KeepIncoming,
        Ordering::Less => return Resolution::KeepCurrent,
        Ordering::Equal => {}
    }

    match incoming.version.cmp(&current.version) {
        Ordering::Greater => return Resolution::KeepIncoming,
        Ordering::Less => return Resolution::KeepCurrent,
        Ordering::Equal => {}
    }

    match incoming.payload_hash().cmp(&current.payload_hash()) {
        Ordering::Greater => Resolution::KeepIncoming,
        Ordering::Less => Resolution::KeepCurrent,
        Ordering::Equal => Resolution::Converged,
    }
}
