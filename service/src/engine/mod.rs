//! The sync engine: spawns one worker per enabled `(type, direction)` pair,
//! reconfigures on every mode change, and owns the username-uniqueness gate.

pub mod hotset;
pub mod status;
pub mod worker;

pub use hotset::HotSet;
pub use status::{StatusRegistry, TypeStatus};
pub use worker::{CycleOutcome, CycleSummary, WorkerContext};

use crate::detector::ModeState;
use crate::error::{Result, SyncError};
use crate::store::{LocalStore, StoreAdapter};
use crate::SharedStores;
use flowsync_core::{
    DataType, DeploymentMode, MonotonicClock, PolicyRegistry, Record, StoreOrigin, SyncDirection,
    SyncStrategy,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Deadline for workers to finish their in-flight record when draining.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

/// Cadence of the tombstone retention sweep.
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Per-peer uniqueness probe timeout.
const UNIQUENESS_TIMEOUT: Duration = Duration::from_secs(10);

struct WorkerHandle {
    data_type: DataType,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct WorkerSet {
    generation: Option<CancellationToken>,
    handles: Vec<WorkerHandle>,
}

/// Spawns, drains, and reconfigures the sync workers.
pub struct SyncEngine {
    stores: SharedStores,
    local: Arc<LocalStore>,
    clock: Arc<MonotonicClock>,
    base_policies: PolicyRegistry,
    status: Arc<StatusRegistry>,
    hot_set: Arc<HotSet>,
    external_permits: Arc<Semaphore>,
    mode_rx: watch::Receiver<ModeState>,
    /// Master on/off from `ENABLE_DATA_SYNC`.
    enabled: bool,
    /// Types owned by the config sync fast path, not by regular workers.
    excluded: Vec<DataType>,
    workers: Mutex<WorkerSet>,
    fenced: AtomicBool,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: SharedStores,
        local: Arc<LocalStore>,
        clock: Arc<MonotonicClock>,
        base_policies: PolicyRegistry,
        mode_rx: watch::Receiver<ModeState>,
        enabled: bool,
        excluded: Vec<DataType>,
        max_parallel: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            local,
            clock,
            base_policies,
            status: Arc::new(StatusRegistry::new()),
            hot_set: Arc::new(HotSet::new()),
            external_permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            mode_rx,
            enabled,
            excluded,
            workers: Mutex::new(WorkerSet::default()),
            fenced: AtomicBool::new(false),
        })
    }

    pub fn status_registry(&self) -> Arc<StatusRegistry> {
        self.status.clone()
    }

    /// The shared cap on concurrent external-store operations.
    pub fn external_permits(&self) -> Arc<Semaphore> {
        self.external_permits.clone()
    }

    pub fn hot_set(&self) -> Arc<HotSet> {
        self.hot_set.clone()
    }

    /// Collaborators report project accesses here to feed on-demand sync.
    pub fn record_access(&self, project_id: &str) {
        self.hot_set.record_access(project_id);
    }

    /// The effective policy table for the currently published mode.
    pub fn effective_policies(&self) -> PolicyRegistry {
        self.base_policies.for_mode(self.mode_rx.borrow().current)
    }

    /// Per-type status report.
    pub fn status_report(&self) -> Vec<TypeStatus> {
        let now = self.clock.now_millis();
        let effective = self.effective_policies();
        DataType::ALL
            .iter()
            .map(|t| {
                let enabled = self.enabled && effective.policy(*t).enabled;
                self.status.type_status(*t, enabled, now)
            })
            .collect()
    }

    /// React to mode changes and sweep tombstones until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut mode_rx = self.mode_rx.clone();
        let mut last_mode = mode_rx.borrow().current;
        self.reconfigure(last_mode).await;

        let mut gc = tokio::time::interval(GC_INTERVAL);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        gc.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = mode_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *mode_rx.borrow();
                    if state.current != last_mode {
                        last_mode = state.current;
                        // During a switch the transition manager drives the
                        // fence/resume cycle itself.
                        if !state.switch_in_progress {
                            self.reconfigure(state.current).await;
                        }
                    }
                }
                _ = gc.tick() => {
                    match self.local.purge_tombstones(self.clock.now_millis()).await {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "purged expired tombstones"),
                        Err(e) => tracing::warn!(error = %e, "tombstone sweep failed"),
                    }
                }
            }
        }

        self.drain(DRAIN_DEADLINE).await;
    }

    /// Drain current workers and respawn for `mode`.
    async fn reconfigure(&self, mode: DeploymentMode) {
        self.drain(DRAIN_DEADLINE).await;
        if self.fenced.load(Ordering::SeqCst) {
            return;
        }
        self.spawn_workers(mode).await;
    }

    /// Stop accepting new ticks and drain workers within the deadline.
    /// Workers that cannot drain are force-killed; their cursors were only
    /// advanced past successes, so nothing is lost.
    pub async fn fence(&self, deadline: Duration) {
        self.fenced.store(true, Ordering::SeqCst);
        self.drain(deadline).await;
    }

    /// Lift the fence and respawn workers for the currently published mode.
    /// With `reset_critical`, critical-type cursors are cleared first so the
    /// next cycle runs a full scan to seed a new peer.
    pub async fn resume(&self, reset_critical: bool) {
        if reset_critical {
            if let Err(e) = self.local.reset_cursors(Some(&DataType::CRITICAL)).await {
                tracing::warn!(error = %e, "failed to reset critical cursors");
            }
        }
        self.fenced.store(false, Ordering::SeqCst);
        let mode = self.mode_rx.borrow().current;
        self.reconfigure(mode).await;
        let _ = self.trigger(None).await;
    }

    /// Run all workers (or one type's workers) out of band.
    pub async fn trigger(&self, data_type: Option<DataType>) -> Result<usize> {
        let workers = self.workers.lock().await;
        let mut woken = 0;
        for handle in &workers.handles {
            if data_type.is_none() || data_type == Some(handle.data_type) {
                if handle.trigger.try_send(()).is_ok() {
                    woken += 1;
                }
            }
        }
        Ok(woken)
    }

    async fn drain(&self, deadline: Duration) {
        let mut workers = self.workers.lock().await;
        let Some(generation) = workers.generation.take() else {
            return;
        };
        generation.cancel();

        let handles = std::mem::take(&mut workers.handles);
        for handle in handles {
            let mut join = handle.join;
            match tokio::time::timeout(deadline, &mut join).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        data_type = %handle.data_type,
                        "worker missed the drain deadline, aborting"
                    );
                    join.abort();
                }
            }
        }
        self.status.clear();
    }

    async fn spawn_workers(&self, mode: DeploymentMode) {
        if !self.enabled {
            tracing::info!("data sync disabled by configuration");
            return;
        }

        let effective = self.base_policies.for_mode(mode);
        let stores = self.stores.read().await;
        let local_dyn: Arc<dyn StoreAdapter> = stores.local.clone();
        let object_dyn: Option<Arc<dyn StoreAdapter>> = stores
            .object
            .clone()
            .map(|o| o as Arc<dyn StoreAdapter>);

        let generation = CancellationToken::new();
        let mut workers = self.workers.lock().await;
        let mut spawned = 0usize;

        for (data_type, policy) in effective.iter() {
            if !policy.enabled || self.excluded.contains(&data_type) {
                continue;
            }

            let mut pairs: Vec<(SyncDirection, Arc<dyn StoreAdapter>, Arc<dyn StoreAdapter>)> =
                Vec::new();

            if policy.strategy == SyncStrategy::BackupOnly {
                if let Some(object) = &object_dyn {
                    pairs.push((
                        SyncDirection::LocalToExternal,
                        local_dyn.clone(),
                        object.clone(),
                    ));
                }
            } else {
                for direction in &policy.directions {
                    let pair = match direction {
                        SyncDirection::LocalToExternal => stores
                            .external
                            .clone()
                            .map(|e| (local_dyn.clone(), e)),
                        SyncDirection::ExternalToLocal => stores
                            .external
                            .clone()
                            .map(|e| (e, local_dyn.clone())),
                    };
                    if let Some((source, dest)) = pair {
                        pairs.push((*direction, source, dest));
                    }
                }
            }

            for (direction, source, dest) in pairs {
                let (trigger_tx, trigger_rx) = mpsc::channel(4);
                let ctx = WorkerContext {
                    data_type,
                    direction,
                    policy: policy.clone(),
                    source,
                    dest,
                    cursors: self.local.clone(),
                    external_permits: self.external_permits.clone(),
                    status: self.status.clone(),
                    hot_set: self.hot_set.clone(),
                    clock: self.clock.clone(),
                };
                self.status.register(data_type, direction);
                let join = tokio::spawn(worker::run_worker(
                    ctx,
                    trigger_rx,
                    generation.child_token(),
                ));
                workers.handles.push(WorkerHandle {
                    data_type,
                    trigger: trigger_tx,
                    join,
                });
                spawned += 1;
            }
        }

        workers.generation = Some(generation);
        tracing::info!(mode = %mode, workers = spawned, "sync workers configured");
    }

    /// Create a `users` record, enforcing global username uniqueness.
    ///
    /// Usernames are case-insensitive; ids are canonicalized to lowercase.
    /// With an external peer configured, the peer is consulted
    /// synchronously: a live record there fails the create with
    /// `UsernameConflict`, and an unreachable peer fails it with
    /// `UniquenessUnverifiable` rather than risking a conflict.
    pub async fn create_user(
        &self,
        username: &str,
        payload: serde_json::Value,
    ) -> Result<Record> {
        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return Err(SyncError::Internal("empty username".into()));
        }

        let stores = self.stores.read().await;
        if let Some(external) = &stores.external {
            match tokio::time::timeout(
                UNIQUENESS_TIMEOUT,
                external.get(DataType::Users, &username),
            )
            .await
            {
                Err(_) => return Err(SyncError::UniquenessUnverifiable),
                Ok(Err(e)) if e.is_retryable() => return Err(SyncError::UniquenessUnverifiable),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(Some(existing))) if existing.is_live() => {
                    return Err(SyncError::UsernameConflict(username));
                }
                Ok(Ok(_)) => {}
            }
        }

        let record = Record::new(
            DataType::Users,
            username,
            payload,
            self.clock.now_millis(),
            StoreOrigin::Local,
        );
        stores.local.put(&record).await?;
        Ok(record)
    }
}
