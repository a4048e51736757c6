//! The config sync fast path.
//!
//! A specialization of the sync engine dedicated to `system_configs` and
//! `ai_provider_configs`: environment-provided settings are seeded into the
//! local store once, then mirrored with the external peer every critical
//! interval regardless of what the regular policy table says. Applied
//! updates are published over a broadcast channel so the auth and
//! AI-provider layers can react without calling back in.

use crate::detector::ModeState;
use crate::engine::worker::{self, WorkerContext};
use crate::engine::{HotSet, StatusRegistry};
use crate::error::Result;
use crate::store::{LocalStore, StoreAdapter};
use crate::SharedStores;
use flowsync_core::{
    DataType, MonotonicClock, PolicyRegistry, Record, StoreOrigin, SyncDirection,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// The critical interval: config types mirror this often.
pub const CRITICAL_INTERVAL: Duration = Duration::from_secs(30);

/// The two types this service owns.
pub const CONFIG_TYPES: [DataType; 2] = [DataType::SystemConfigs, DataType::AiProviderConfigs];

/// Notification of a configuration record applied from the external peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub data_type: DataType,
    pub id: String,
}

/// Mirrors critical configuration between stores.
pub struct ConfigSyncService {
    local: Arc<LocalStore>,
    stores: SharedStores,
    clock: Arc<MonotonicClock>,
    mode_rx: watch::Receiver<ModeState>,
    status: Arc<StatusRegistry>,
    permits: Arc<Semaphore>,
    settings: crate::config::EnvSettings,
    updates_tx: broadcast::Sender<ConfigUpdate>,
    interval: Duration,
}

impl ConfigSyncService {
    pub fn new(
        local: Arc<LocalStore>,
        stores: SharedStores,
        clock: Arc<MonotonicClock>,
        mode_rx: watch::Receiver<ModeState>,
        status: Arc<StatusRegistry>,
        permits: Arc<Semaphore>,
        settings: crate::config::EnvSettings,
    ) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            local,
            stores,
            clock,
            mode_rx,
            status,
            permits,
            settings,
            updates_tx,
            interval: CRITICAL_INTERVAL,
        })
    }

    /// Subscribe to applied configuration updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdate> {
        self.updates_tx.subscribe()
    }

    /// Seed environment-provided settings into the local store. Existing
    /// records win; the environment only fills gaps, so values already
    /// inherited from a peer are not clobbered.
    pub async fn seed(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut seeded = 0;

        for (data_type, id, payload) in self.seed_records() {
            if self.local.get(data_type, &id).await?.is_some() {
                continue;
            }
            let record = Record::new(data_type, id, payload, now, StoreOrigin::Local);
            self.local.put(&record).await?;
            seeded += 1;
        }

        if seeded > 0 {
            tracing::info!(seeded, "environment settings seeded into local store");
        }
        Ok(seeded)
    }

    fn seed_records(&self) -> Vec<(DataType, String, serde_json::Value)> {
        let s = &self.settings;
        let mut records = Vec::new();

        if s.admin_username.is_some() || s.admin_password.is_some() {
            records.push((
                DataType::SystemConfigs,
                "default_admin".to_string(),
                serde_json::json!({
                    "username": s.admin_username,
                    "password": s.admin_password,
                }),
            ));
        }
        if let Some(secret) = &s.jwt_secret {
            records.push((
                DataType::SystemConfigs,
                "jwt_secret".to_string(),
                serde_json::json!({ "value": secret }),
            ));
        }
        if s.captcha_site_key.is_some() || s.captcha_secret_key.is_some() {
            records.push((
                DataType::SystemConfigs,
                "captcha".to_string(),
                serde_json::json!({
                    "site_key": s.captcha_site_key,
                    "secret_key": s.captcha_secret_key,
                }),
            ));
        }
        if let Some(limit) = s.max_upload_mb {
            records.push((
                DataType::SystemConfigs,
                "upload_limits".to_string(),
                serde_json::json!({ "max_upload_mb": limit }),
            ));
        }
        if let Some(enabled) = s.enable_login_captcha {
            records.push((
                DataType::SystemConfigs,
                "login_captcha".to_string(),
                serde_json::json!({ "enabled": enabled }),
            ));
        }
        for provider in &s.providers {
            records.push((
                DataType::AiProviderConfigs,
                provider.name.clone(),
                serde_json::json!({
                    "api_key": provider.api_key,
                    "base_url": provider.base_url,
                }),
            ));
        }
        records
    }

    /// One bidirectional mirror pass over both config types. Returns the
    /// number of records applied.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<usize> {
        let external = {
            let stores = self.stores.read().await;
            stores.external.clone()
        };
        let Some(external) = external else {
            return Ok(0);
        };
        let local: Arc<dyn StoreAdapter> = self.local.clone();
        let policies = PolicyRegistry::builtin();

        let mut applied = 0;
        for data_type in CONFIG_TYPES {
            for direction in [SyncDirection::ExternalToLocal, SyncDirection::LocalToExternal] {
                let (source, dest) = match direction {
                    SyncDirection::ExternalToLocal => (external.clone(), local.clone()),
                    SyncDirection::LocalToExternal => (local.clone(), external.clone()),
                };

                let ctx = WorkerContext {
                    data_type,
                    direction,
                    policy: policies.policy(data_type).clone(),
                    source,
                    dest,
                    cursors: self.local.clone(),
                    external_permits: self.permits.clone(),
                    status: self.status.clone(),
                    hot_set: Arc::new(HotSet::new()),
                    clock: self.clock.clone(),
                };

                let mut in_flight = HashSet::new();
                let outcome = worker::run_cycle(&ctx, &mut in_flight, cancel).await?;
                applied += outcome.summary.applied;

                if direction == SyncDirection::ExternalToLocal {
                    for id in outcome.applied_ids {
                        let _ = self.updates_tx.send(ConfigUpdate { data_type, id });
                    }
                }
            }
        }
        Ok(applied)
    }

    /// The fast-path loop: runs at the critical interval whenever an
    /// external peer exists, in every mode.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.seed().await {
            tracing::warn!(error = %e, "failed to seed environment settings");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if !self.mode_rx.borrow().current.includes_external() {
                continue;
            }
            match self.run_pass(&cancel).await {
                Ok(0) => {}
                Ok(applied) => tracing::debug!(applied, "config fast-path applied updates"),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "config fast-path pass skipped")
                }
                Err(e) => tracing::warn!(error = %e, "config fast-path pass failed"),
            }
        }
    }
}
