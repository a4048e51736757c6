//! Worker status registry, aggregated by the control API.

use crate::engine::worker::CycleSummary;
use dashmap::DashMap;
use flowsync_core::{DataType, SyncDirection, Timestamp};
use serde::Serialize;

/// Live state of one worker.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub degraded: bool,
    pub last_run: Option<Timestamp>,
    pub last_result: Option<CycleSummary>,
    pub last_error: Option<String>,
    pub cursor_updated_at: Timestamp,
}

/// Per-type status as reported by `get_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatus {
    pub data_type: DataType,
    pub enabled: bool,
    pub degraded: bool,
    pub healthy: bool,
    pub last_run: Option<Timestamp>,
    pub last_result: Option<CycleSummary>,
    pub cursor_age_ms: Option<u64>,
}

/// Shared registry the workers report into.
#[derive(Default)]
pub struct StatusRegistry {
    entries: DashMap<(DataType, SyncDirection), WorkerState>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned worker.
    pub fn register(&self, data_type: DataType, direction: SyncDirection) {
        self.entries
            .insert((data_type, direction), WorkerState::default());
    }

    /// Drop every entry; called when the engine reconfigures.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn record_cycle(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        summary: CycleSummary,
        cursor_updated_at: Timestamp,
        now: Timestamp,
    ) {
        let mut entry = self.entries.entry((data_type, direction)).or_default();
        entry.degraded = false;
        entry.last_run = Some(now);
        entry.last_error = None;
        entry.last_result = Some(summary);
        entry.cursor_updated_at = cursor_updated_at;
    }

    pub fn record_error(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        error: &str,
        degraded: bool,
    ) {
        let mut entry = self.entries.entry((data_type, direction)).or_default();
        entry.last_error = Some(error.to_string());
        if degraded {
            entry.degraded = true;
        }
    }

    /// A type is healthy when every one of its workers has completed a cycle
    /// without error and none is degraded.
    pub fn is_healthy(&self, data_type: DataType) -> bool {
        let mut any = false;
        for entry in self.entries.iter() {
            if entry.key().0 != data_type {
                continue;
            }
            any = true;
            let state = entry.value();
            if state.degraded || state.last_run.is_none() || state.last_error.is_some() {
                return false;
            }
        }
        any
    }

    /// Aggregate the per-direction entries of one type.
    pub fn type_status(&self, data_type: DataType, enabled: bool, now: Timestamp) -> TypeStatus {
        let mut degraded = false;
        let mut last_run = None;
        let mut last_result = None;
        let mut cursor_age_ms = None;

        for entry in self.entries.iter() {
            if entry.key().0 != data_type {
                continue;
            }
            let state = entry.value();
            degraded |= state.degraded;
            if state.last_run > last_run {
                last_run = state.last_run;
                last_result = state.last_result.clone();
            }
            let age = now.saturating_sub(state.cursor_updated_at);
            cursor_age_ms = Some(cursor_age_ms.map_or(age, |a: u64| a.max(age)));
        }

        TypeStatus {
            data_type,
            enabled,
            degraded,
            healthy: self.is_healthy(data_type),
            last_run,
            last_result,
            cursor_age_ms,
        }
    }
}
