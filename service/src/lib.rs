//! # FlowSync Service
//!
//! The IO half of the FlowSync deployment-mode and data synchronization
//! core: store adapters over SQLite, Postgres, and S3-compatible object
//! storage, the mode detector, the sync engine and its workers, the
//! snapshot engine, the transition manager, the config fast path, and the
//! in-process control API.
//!
//! [`Service::start`] wires everything from a [`config::Config`] and spawns
//! the long-running tasks; [`ControlApi`] is the operations surface
//! collaborators and the HTTP facade talk to.

pub mod config;
pub mod config_sync;
pub mod control;
pub mod crypto;
pub mod detector;
pub mod engine;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod transition;

pub use config::Config;
pub use control::ControlApi;
pub use error::{Result, SyncError};

use crate::config_sync::{ConfigSyncService, ConfigUpdate};
use crate::crypto::PayloadCipher;
use crate::detector::ModeDetector;
use crate::engine::SyncEngine;
use crate::snapshot::SnapshotEngine;
use crate::store::{ExternalStore, LocalStore, ObjectStoreAdapter, StoreAdapter};
use crate::transition::{DefaultPeerFactory, TransitionManager};
use flowsync_core::{DataType, MonotonicClock, PolicyRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// The currently active set of store adapters. Transitions swap the peers;
/// the local store lives for the whole process.
pub struct Stores {
    pub local: Arc<LocalStore>,
    pub external: Option<Arc<dyn StoreAdapter>>,
    pub object: Option<Arc<ObjectStoreAdapter>>,
}

/// Shared, transition-swappable view of the active stores.
pub type SharedStores = Arc<RwLock<Stores>>;

/// Budget for startup-time external migrations; the peer may be down and
/// the detector owns reachability, so startup never blocks on it for long.
const STARTUP_MIGRATE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running FlowSync core.
pub struct Service {
    control: Arc<ControlApi>,
    config_sync: Arc<ConfigSyncService>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Service {
    /// Wire every component from the configuration and spawn the detector,
    /// engine, config fast path, and snapshot scheduler.
    pub async fn start(config: Config) -> Result<Self> {
        let clock = Arc::new(MonotonicClock::new());
        let cipher = config
            .encryption_key
            .as_ref()
            .map(|key| Arc::new(PayloadCipher::new(key)));

        let mut policies = PolicyRegistry::builtin();
        policies.apply_overrides(config.sync_interval, config.sync_directions.as_deref());

        let retention_ms = policies.longest_active_interval().max(3600) * 1000;
        let local = Arc::new(LocalStore::connect(config.local_db_path(), retention_ms).await?);

        let external = match &config.database_url {
            Some(url) => {
                let store = ExternalStore::connect(
                    url,
                    config.external_max_connections,
                    cipher.clone(),
                )?;
                match tokio::time::timeout(STARTUP_MIGRATE_TIMEOUT, store.migrate()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "external migrations deferred; peer not ready")
                    }
                    Err(_) => tracing::warn!("external migrations deferred; peer not responding"),
                }
                Some(Arc::new(store) as Arc<dyn StoreAdapter>)
            }
            None => None,
        };

        let object = match &config.r2 {
            Some(r2) => Some(Arc::new(ObjectStoreAdapter::for_r2(r2)?)),
            None => None,
        };

        let stores: SharedStores = Arc::new(RwLock::new(Stores {
            local: local.clone(),
            external,
            object,
        }));

        let detector = ModeDetector::new(stores.clone(), clock.clone(), config.mode_override);
        if let Err(e) = detector.check_once().await {
            tracing::warn!(error = %e, "initial mode detection failed");
        }
        let mode_rx = detector.subscribe();

        let engine = SyncEngine::new(
            stores.clone(),
            local.clone(),
            clock.clone(),
            policies,
            mode_rx.clone(),
            config.enable_data_sync,
            config_sync::CONFIG_TYPES.to_vec(),
            config.max_parallel.unwrap_or(DataType::ALL.len()),
        );

        let config_sync = ConfigSyncService::new(
            local.clone(),
            stores.clone(),
            clock.clone(),
            mode_rx.clone(),
            engine.status_registry(),
            engine.external_permits(),
            config.settings.clone(),
        );

        let snapshots = SnapshotEngine::new(
            local.clone(),
            stores.clone(),
            clock.clone(),
            mode_rx,
            config.backup_retention_days,
            config.backup_schedule.as_deref(),
        )?;

        let factory = Arc::new(DefaultPeerFactory::new(
            cipher,
            config.external_max_connections,
        ));
        let transitions = Arc::new(TransitionManager::new(
            stores,
            local,
            engine.clone(),
            snapshots.clone(),
            detector.clone(),
            clock,
            factory,
        ));

        let control = Arc::new(ControlApi::new(
            detector.clone(),
            engine.clone(),
            snapshots.clone(),
            transitions,
        ));

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(detector.run(cancel.child_token())),
            tokio::spawn(engine.run(cancel.child_token())),
            tokio::spawn(config_sync.clone().run(cancel.child_token())),
            tokio::spawn(snapshots.run(cancel.child_token())),
        ];

        Ok(Self {
            control,
            config_sync,
            cancel,
            tasks,
        })
    }

    /// The operations surface.
    pub fn control(&self) -> Arc<ControlApi> {
        self.control.clone()
    }

    /// Subscribe to configuration records applied from the external peer.
    pub fn subscribe_config_updates(&self) -> broadcast::Receiver<ConfigUpdate> {
        self.config_sync.subscribe()
    }

    /// Cancel every task and wait for them to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "task ended abnormally during shutdown");
                }
            }
        }
    }
}
