//! The inward-facing control surface.
//!
//! Transport-agnostic operations over the running core; an HTTP facade
//! outside this crate maps them onto routes. Every operation returns
//! serde-serializable reports and the structured errors of
//! [`crate::error::SyncError`].

use crate::config::PeerConfig;
use crate::detector::{ModeDetector, ModeState};
use crate::engine::{SyncEngine, TypeStatus};
use crate::error::Result;
use crate::snapshot::{RestoreOutcome, SnapshotEngine};
use crate::transition::{TransitionManager, ValidationReport};
use flowsync_core::{BackupManifest, DataType, DeploymentMode, Record, TransitionRecord};
use std::sync::Arc;

/// The operations surface aggregated over the core's components.
pub struct ControlApi {
    detector: Arc<ModeDetector>,
    engine: Arc<SyncEngine>,
    snapshots: Arc<SnapshotEngine>,
    transitions: Arc<TransitionManager>,
}

impl ControlApi {
    pub fn new(
        detector: Arc<ModeDetector>,
        engine: Arc<SyncEngine>,
        snapshots: Arc<SnapshotEngine>,
        transitions: Arc<TransitionManager>,
    ) -> Self {
        Self {
            detector,
            engine,
            snapshots,
            transitions,
        }
    }

    /// Current and detected mode, plus transition state.
    pub fn get_mode(&self) -> ModeState {
        self.detector.state()
    }

    /// Per-type sync status.
    pub fn get_status(&self) -> Vec<TypeStatus> {
        self.engine.status_report()
    }

    /// Check a candidate mode/config pair without changing anything.
    pub async fn validate(
        &self,
        target: DeploymentMode,
        config: &PeerConfig,
    ) -> ValidationReport {
        self.transitions.validate(target, config).await
    }

    /// Run all workers (or one type's) out of band. Returns how many woke.
    pub async fn trigger_sync(&self, data_type: Option<DataType>) -> Result<usize> {
        self.engine.trigger(data_type).await
    }

    /// Execute a mode transition.
    pub async fn switch_mode(
        &self,
        target: DeploymentMode,
        config: PeerConfig,
        reason: &str,
    ) -> Result<TransitionRecord> {
        self.transitions
            .transition(target, config, reason, "control-api")
            .await
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        self.snapshots.list_backups().await
    }

    pub async fn create_backup(&self) -> Result<BackupManifest> {
        self.snapshots.create_backup().await
    }

    pub async fn restore(&self, backup_id: &str) -> Result<RestoreOutcome> {
        self.snapshots.restore(backup_id).await
    }

    /// The transition log, newest first.
    pub async fn get_history(&self, limit: usize) -> Result<Vec<TransitionRecord>> {
        self.transitions.history(limit).await
    }

    /// Create a user record with the global uniqueness check.
    pub async fn create_user(&self, username: &str, payload: serde_json::Value) -> Result<Record> {
        self.engine.create_user(username, payload).await
    }

    /// Collaborators report project accesses to feed on-demand sync.
    pub fn record_access(&self, project_id: &str) {
        self.engine.record_access(project_id);
    }
}
