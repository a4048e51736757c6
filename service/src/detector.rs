//! Deployment-mode detection.
//!
//! Probes the configured peers on a fixed cadence and publishes the active
//! mode over a watch channel; subscribers receive the latest value and every
//! change. A peer only counts as down after two consecutive failed cycles,
//! so a single missed ping never flips the mode.

use crate::error::Result;
use crate::SharedStores;
use flowsync_core::{DeploymentMode, MonotonicClock, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Probe cadence.
pub const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Per-probe timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed cycles before a peer counts as down.
const MISSES_TO_DROP: u8 = 2;

/// The published mode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    /// The mode the system operates in.
    pub current: DeploymentMode,
    /// The mode the last detection cycle computed.
    pub detected: DeploymentMode,
    /// Whether a transition currently holds the control lock.
    pub switch_in_progress: bool,
    /// Millisecond timestamp of the last detection cycle.
    pub last_check: Timestamp,
}

#[derive(Debug, Default)]
struct PeerHealth {
    up: bool,
    misses: u8,
}

impl PeerHealth {
    fn observe(&mut self, ok: bool) {
        if ok {
            self.up = true;
            self.misses = 0;
        } else {
            self.misses = self.misses.saturating_add(1);
            if self.misses >= MISSES_TO_DROP {
                self.up = false;
            }
        }
    }

    fn reset(&mut self, up: bool) {
        self.up = up;
        self.misses = 0;
    }
}

struct DetectorInner {
    external: PeerHealth,
    object: PeerHealth,
    /// Set by a transition; the next detection cycle republishes the forced
    /// mode instead of its own computation.
    pinned: bool,
    switch_in_progress: bool,
}

/// Computes and publishes the active deployment mode.
pub struct ModeDetector {
    stores: SharedStores,
    clock: Arc<MonotonicClock>,
    override_mode: Option<DeploymentMode>,
    interval: Duration,
    tx: watch::Sender<ModeState>,
    inner: Mutex<DetectorInner>,
}

impl ModeDetector {
    pub fn new(
        stores: SharedStores,
        clock: Arc<MonotonicClock>,
        override_mode: Option<DeploymentMode>,
    ) -> Arc<Self> {
        Self::with_interval(stores, clock, override_mode, DETECTION_INTERVAL)
    }

    pub fn with_interval(
        stores: SharedStores,
        clock: Arc<MonotonicClock>,
        override_mode: Option<DeploymentMode>,
        interval: Duration,
    ) -> Arc<Self> {
        let initial = override_mode.unwrap_or(DeploymentMode::LocalOnly);
        let (tx, _) = watch::channel(ModeState {
            current: initial,
            detected: initial,
            switch_in_progress: false,
            last_check: 0,
        });

        Arc::new(Self {
            stores,
            clock,
            override_mode,
            interval,
            tx,
            inner: Mutex::new(DetectorInner {
                external: PeerHealth::default(),
                object: PeerHealth::default(),
                pinned: false,
                switch_in_progress: false,
            }),
        })
    }

    /// Latest-value, multi-subscriber channel of mode changes.
    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.tx.subscribe()
    }

    /// The currently published state.
    pub fn state(&self) -> ModeState {
        *self.tx.borrow()
    }

    /// Run one detection cycle.
    pub async fn check_once(&self) -> Result<()> {
        let now = self.clock.now_millis();

        if let Some(mode) = self.override_mode {
            let inner = self.inner.lock().await;
            self.publish(mode, mode, inner.switch_in_progress, now);
            return Ok(());
        }

        let (external, object) = {
            let stores = self.stores.read().await;
            (stores.external.clone(), stores.object.clone())
        };

        let external_ok = match &external {
            Some(adapter) => ping_with_timeout(adapter.as_ref()).await,
            None => false,
        };
        let object_ok = match &object {
            Some(adapter) => {
                let adapter: &dyn crate::store::StoreAdapter = adapter.as_ref();
                ping_with_timeout(adapter).await
            }
            None => false,
        };

        let mut inner = self.inner.lock().await;
        if external.is_some() {
            inner.external.observe(external_ok);
        } else {
            inner.external.reset(false);
        }
        if object.is_some() {
            inner.object.observe(object_ok);
        } else {
            inner.object.reset(false);
        }

        let detected = DeploymentMode::from_reachability(
            external.is_some() && inner.external.up,
            object.is_some() && inner.object.up,
        );

        let current = if inner.pinned {
            inner.pinned = false;
            self.tx.borrow().current
        } else {
            detected
        };

        if current != self.tx.borrow().current {
            tracing::info!(from = %self.tx.borrow().current, to = %current, "deployment mode changed");
        }
        self.publish(current, detected, inner.switch_in_progress, now);
        Ok(())
    }

    /// Publish a mode decided by a transition, bypassing detection for one
    /// cycle. Peers the mode includes were just probed by the transition and
    /// are marked up.
    pub async fn force_publish(&self, mode: DeploymentMode) {
        let mut inner = self.inner.lock().await;
        inner.pinned = true;
        inner.external.reset(mode.includes_external());
        inner.object.reset(mode.includes_object());
        let now = self.clock.now_millis();
        self.publish(mode, mode, inner.switch_in_progress, now);
    }

    /// Flag a transition in flight on the published state.
    pub async fn set_switch_in_progress(&self, in_progress: bool) {
        let mut inner = self.inner.lock().await;
        inner.switch_in_progress = in_progress;
        let state = *self.tx.borrow();
        self.publish(state.current, state.detected, in_progress, state.last_check);
    }

    fn publish(
        &self,
        current: DeploymentMode,
        detected: DeploymentMode,
        switch_in_progress: bool,
        last_check: Timestamp,
    ) {
        self.tx.send_replace(ModeState {
            current,
            detected,
            switch_in_progress,
            last_check,
        });
    }

    /// The detection loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.check_once().await {
                tracing::warn!(error = %e, "mode detection cycle failed");
            }
        }
    }
}

async fn ping_with_timeout(adapter: &dyn crate::store::StoreAdapter) -> bool {
    matches!(
        tokio::time::timeout(PING_TIMEOUT, adapter.ping()).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::store::{Page, StoreAdapter, StoreBatch};
    use crate::Stores;
    use async_trait::async_trait;
    use flowsync_core::{ApplyOutcome, CursorToken, DataType, Record, StoreOrigin};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;

    /// Ping-only stub whose reachability can be toggled.
    struct FlakyPeer {
        reachable: AtomicBool,
    }

    impl FlakyPeer {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(reachable),
            })
        }

        fn set_reachable(&self, up: bool) {
            self.reachable.store(up, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StoreAdapter for FlakyPeer {
        fn origin(&self) -> StoreOrigin {
            StoreOrigin::External
        }

        async fn get(&self, _: DataType, _: &str) -> crate::error::Result<Option<Record>> {
            Ok(None)
        }

        async fn put(&self, _: &Record) -> crate::error::Result<ApplyOutcome> {
            Ok(ApplyOutcome::Applied)
        }

        async fn delete(
            &self,
            _: DataType,
            _: &str,
            _: u64,
        ) -> crate::error::Result<ApplyOutcome> {
            Ok(ApplyOutcome::Applied)
        }

        async fn list_since(
            &self,
            _: DataType,
            _: &CursorToken,
            _: usize,
        ) -> crate::error::Result<Page> {
            Ok(Page::default())
        }

        async fn ping(&self) -> crate::error::Result<()> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SyncError::Retryable("connection refused".into()))
            }
        }

        async fn begin_batch(&self) -> crate::error::Result<Box<dyn StoreBatch>> {
            Err(SyncError::Internal("not supported".into()))
        }
    }

    async fn local_store() -> (Arc<crate::store::LocalStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::LocalStore::connect(dir.path().join("db"), 0)
            .await
            .unwrap();
        (Arc::new(store), dir)
    }

    fn shared(local: Arc<crate::store::LocalStore>, external: Option<Arc<FlakyPeer>>) -> SharedStores {
        Arc::new(RwLock::new(Stores {
            local,
            external: external.map(|e| e as Arc<dyn StoreAdapter>),
            object: None,
        }))
    }

    #[tokio::test]
    async fn no_peers_means_local_only() {
        let (local, _dir) = local_store().await;
        let detector = ModeDetector::new(
            shared(local, None),
            Arc::new(MonotonicClock::new()),
            None,
        );
        detector.check_once().await.unwrap();

        let state = detector.state();
        assert_eq!(state.current, DeploymentMode::LocalOnly);
        assert_eq!(state.detected, DeploymentMode::LocalOnly);
        assert!(state.last_check > 0);
    }

    #[tokio::test]
    async fn reachable_external_enables_external_mode() {
        let (local, _dir) = local_store().await;
        let peer = FlakyPeer::new(true);
        let detector = ModeDetector::new(
            shared(local, Some(peer)),
            Arc::new(MonotonicClock::new()),
            None,
        );
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);
    }

    #[tokio::test]
    async fn single_missed_ping_does_not_flip_mode() {
        let (local, _dir) = local_store().await;
        let peer = FlakyPeer::new(true);
        let detector = ModeDetector::new(
            shared(local, Some(peer.clone())),
            Arc::new(MonotonicClock::new()),
            None,
        );

        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);

        // One missed ping: mode holds.
        peer.set_reachable(false);
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);

        // Second consecutive miss: mode drops.
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalOnly);

        // Recovery flips back immediately.
        peer.set_reachable(true);
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);
    }

    #[tokio::test]
    async fn override_pins_mode_and_skips_probing() {
        let (local, _dir) = local_store().await;
        let peer = FlakyPeer::new(false);
        let detector = ModeDetector::new(
            shared(local, Some(peer)),
            Arc::new(MonotonicClock::new()),
            Some(DeploymentMode::LocalExternal),
        );

        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);
        assert_eq!(detector.state().detected, DeploymentMode::LocalExternal);
    }

    #[tokio::test]
    async fn force_publish_survives_one_detection_cycle() {
        let (local, _dir) = local_store().await;
        let detector = ModeDetector::new(
            shared(local, None),
            Arc::new(MonotonicClock::new()),
            None,
        );
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalOnly);

        // A transition switched to LOCAL_EXTERNAL; nothing is wired yet, but
        // the forced mode must hold through the next cycle.
        detector.force_publish(DeploymentMode::LocalExternal).await;
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);

        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalExternal);

        // The cycle after that recomputes from reality.
        detector.check_once().await.unwrap();
        assert_eq!(detector.state().current, DeploymentMode::LocalOnly);
    }

    #[tokio::test]
    async fn switch_in_progress_flag_is_published() {
        let (local, _dir) = local_store().await;
        let detector = ModeDetector::new(
            shared(local, None),
            Arc::new(MonotonicClock::new()),
            None,
        );

        let mut rx = detector.subscribe();
        detector.set_switch_in_progress(true).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().switch_in_progress);

        detector.set_switch_in_progress(false).await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow().switch_in_progress);
    }
}
