//! Online deployment-mode transitions with rollback.
//!
//! The eight steps: validate, probe, fence, snapshot, switch, reconcile,
//! verify, rollback-on-failure. Only one transition may be in flight;
//! concurrent requests fail fast with `TransitionBusy`. Failures before the
//! snapshot step leave no trace in the transition log; anything later is
//! recorded as `succeeded` or `rolled_back`.

use crate::config::{PeerConfig, R2Config};
use crate::crypto::PayloadCipher;
use crate::detector::ModeDetector;
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::snapshot::SnapshotEngine;
use crate::store::{ExternalStore, LocalStore, ObjectStoreAdapter, StoreAdapter};
use crate::SharedStores;
use async_trait::async_trait;
use flowsync_core::{
    DataType, DeploymentMode, MonotonicClock, TransitionRecord, TransitionStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Default drain deadline for step 3.
const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(60);

/// Default post-switch verification window for step 7.
const DEFAULT_VERIFY_WINDOW: Duration = Duration::from_secs(120);

/// How often verification polls the status registry.
const VERIFY_POLL: Duration = Duration::from_millis(250);

/// Builds and readies peer adapters for a candidate configuration.
/// Probing and preparation (schema migration) happen together so a peer
/// that answers pings but cannot hold records still fails the transition.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn external_ready(&self, database_url: &str) -> Result<Arc<dyn StoreAdapter>>;

    async fn object_ready(&self, config: &R2Config) -> Result<Arc<ObjectStoreAdapter>>;
}

/// The production factory: lazy Postgres pool + S3-compatible client.
pub struct DefaultPeerFactory {
    cipher: Option<Arc<PayloadCipher>>,
    max_connections: u32,
}

impl DefaultPeerFactory {
    pub fn new(cipher: Option<Arc<PayloadCipher>>, max_connections: u32) -> Self {
        Self {
            cipher,
            max_connections,
        }
    }
}

#[async_trait]
impl PeerFactory for DefaultPeerFactory {
    async fn external_ready(&self, database_url: &str) -> Result<Arc<dyn StoreAdapter>> {
        let store = ExternalStore::connect(database_url, self.max_connections, self.cipher.clone())?;
        store.ping().await?;
        store.migrate().await?;
        Ok(Arc::new(store))
    }

    async fn object_ready(&self, config: &R2Config) -> Result<Arc<ObjectStoreAdapter>> {
        let adapter = ObjectStoreAdapter::for_r2(config)?;
        adapter.ping().await?;
        Ok(Arc::new(adapter))
    }
}

/// Result of `validate(target_mode, config)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    pub missing_fields: Vec<String>,
    pub unreachable_peers: Vec<String>,
}

/// Serializes and executes mode transitions.
pub struct TransitionManager {
    stores: SharedStores,
    local: Arc<LocalStore>,
    engine: Arc<SyncEngine>,
    snapshots: Arc<SnapshotEngine>,
    detector: Arc<ModeDetector>,
    clock: Arc<MonotonicClock>,
    factory: Arc<dyn PeerFactory>,
    lock: Mutex<()>,
    drain_deadline: Duration,
    verify_window: Duration,
}

impl TransitionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: SharedStores,
        local: Arc<LocalStore>,
        engine: Arc<SyncEngine>,
        snapshots: Arc<SnapshotEngine>,
        detector: Arc<ModeDetector>,
        clock: Arc<MonotonicClock>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        Self {
            stores,
            local,
            engine,
            snapshots,
            detector,
            clock,
            factory,
            lock: Mutex::new(()),
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            verify_window: DEFAULT_VERIFY_WINDOW,
        }
    }

    /// Shrink the drain and verify windows; test setups use this.
    pub fn timing(mut self, drain_deadline: Duration, verify_window: Duration) -> Self {
        self.drain_deadline = drain_deadline;
        self.verify_window = verify_window;
        self
    }

    /// Check a candidate configuration without changing anything.
    pub async fn validate(&self, target: DeploymentMode, config: &PeerConfig) -> ValidationReport {
        let missing_fields = config.missing_fields(target);
        let mut unreachable_peers = Vec::new();

        if missing_fields.is_empty() {
            if target.includes_external() {
                if let Some(url) = &config.database_url {
                    if self.factory.external_ready(url).await.is_err() {
                        unreachable_peers.push("external".to_string());
                    }
                }
            }
            if target.includes_object() {
                if let Some(r2) = &config.r2 {
                    if self.factory.object_ready(r2).await.is_err() {
                        unreachable_peers.push("object".to_string());
                    }
                }
            }
        }

        ValidationReport {
            ok: missing_fields.is_empty() && unreachable_peers.is_empty(),
            missing_fields,
            unreachable_peers,
        }
    }

    /// Execute a transition to `target` with the supplied peer settings.
    pub async fn transition(
        &self,
        target: DeploymentMode,
        config: PeerConfig,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| SyncError::TransitionBusy)?;

        let from_mode = self.detector.state().current;
        tracing::info!(from = %from_mode, to = %target, reason, "mode transition requested");

        // Step 1: validate.
        let missing = config.missing_fields(target);
        if !missing.is_empty() {
            return Err(SyncError::InvalidConfig { missing });
        }

        self.detector.set_switch_in_progress(true).await;
        let result = self
            .execute(from_mode, target, &config, reason, actor)
            .await;
        self.detector.set_switch_in_progress(false).await;

        match &result {
            Ok(record) => {
                tracing::info!(from = %from_mode, to = %target, status = record.status.as_str(), "mode transition finished")
            }
            Err(e) => tracing::warn!(from = %from_mode, to = %target, error = %e, "mode transition failed"),
        }
        result
    }

    async fn execute(
        &self,
        from_mode: DeploymentMode,
        target: DeploymentMode,
        config: &PeerConfig,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord> {
        // Step 2: probe every newly-required peer.
        let new_external = match (&config.database_url, target.includes_external()) {
            (Some(url), true) => Some(
                self.factory
                    .external_ready(url)
                    .await
                    .map_err(|e| SyncError::PeerUnreachable(format!("external: {e}")))?,
            ),
            _ => None,
        };
        let new_object = match (&config.r2, target.includes_object()) {
            (Some(r2), true) => Some(
                self.factory
                    .object_ready(r2)
                    .await
                    .map_err(|e| SyncError::PeerUnreachable(format!("object: {e}")))?,
            ),
            _ => None,
        };

        // Step 3: fence the engine; collaborators keep writing locally.
        self.engine.fence(self.drain_deadline).await;

        let mut record = TransitionRecord::begin(
            from_mode,
            target,
            self.clock.now_millis(),
            reason,
            actor,
        );

        let previous = {
            let stores = self.stores.read().await;
            (stores.external.clone(), stores.object.clone())
        };

        match self
            .switch_and_verify(&mut record, target, new_external, new_object, &previous)
            .await
        {
            Ok(()) => {
                let record = record.finish(
                    TransitionStatus::Succeeded,
                    self.clock.now_millis(),
                    None,
                );
                self.local.append_transition(&record).await?;
                Ok(record)
            }
            Err(e) => {
                // Step 8: rollback to the previous configuration.
                {
                    let mut stores = self.stores.write().await;
                    stores.external = previous.0.clone();
                    stores.object = previous.1.clone();
                }
                self.detector.force_publish(from_mode).await;
                self.engine.resume(false).await;

                let record = record.finish(
                    TransitionStatus::RolledBack,
                    self.clock.now_millis(),
                    Some(e.to_string()),
                );
                if let Err(log_err) = self.local.append_transition(&record).await {
                    tracing::error!(error = %log_err, "failed to record rolled-back transition");
                }
                Err(e)
            }
        }
    }

    async fn switch_and_verify(
        &self,
        record: &mut TransitionRecord,
        target: DeploymentMode,
        new_external: Option<Arc<dyn StoreAdapter>>,
        new_object: Option<Arc<ObjectStoreAdapter>>,
        previous: &(Option<Arc<dyn StoreAdapter>>, Option<Arc<ObjectStoreAdapter>>),
    ) -> Result<()> {
        // Step 4: pre-transition snapshot through whichever object store is
        // available, preferring the incoming one.
        let snapshot_sink = new_object.clone().or_else(|| previous.1.clone());
        if let Some(object) = snapshot_sink {
            let manifest = self.snapshots.create_backup_with(&object).await?;
            record.snapshot_prefix = Some(manifest.prefix);
        }

        // Step 5: swap the active configuration and publish the new mode.
        {
            let mut stores = self.stores.write().await;
            stores.external = new_external;
            stores.object = new_object;
        }
        self.detector.force_publish(target).await;

        // Step 6: resume with critical cursors reset to seed the new peer.
        self.engine.resume(true).await;

        // Step 7: the post-condition check.
        self.verify(target).await
    }

    async fn verify(&self, target: DeploymentMode) -> Result<()> {
        if !target.includes_external() {
            // No external peer means no critical workers to watch.
            return Ok(());
        }

        let status = self.engine.status_registry();
        let deadline = Instant::now() + self.verify_window;
        loop {
            if DataType::CRITICAL.iter().all(|t| status.is_healthy(*t)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Internal(
                    "critical types did not report healthy within the verification window".into(),
                ));
            }
            tokio::time::sleep(VERIFY_POLL).await;
        }
    }

    /// The transition log, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<TransitionRecord>> {
        self.local.list_transitions(limit).await
    }
}
