//! Point-in-time snapshots of the local store, kept in the object store.
//!
//! A snapshot is a gzip'd tar of the local database file plus a manifest
//! JSON under `backups/<yyyymmdd_HHMMSS>/`. Writers are quiesced through the
//! local store's advisory barrier for the duration of the file read, never
//! for the upload.

use crate::detector::ModeState;
use crate::error::{Result, SyncError};
use crate::store::{LocalStore, ObjectStoreAdapter};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use flowsync_core::{BackupManifest, MonotonicClock};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Name of the database file inside the archive.
const DB_ENTRY: &str = "flowsync.db";

/// Outcome of a restore: the local adapter was reopened over the restored
/// file, and a process restart is recommended so collaborators re-read
/// state.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub manifest: BackupManifest,
    pub restart_required: bool,
}

/// Produces, lists, restores, and expires snapshots.
pub struct SnapshotEngine {
    local: Arc<LocalStore>,
    stores: crate::SharedStores,
    clock: Arc<MonotonicClock>,
    mode_rx: watch::Receiver<ModeState>,
    retention_days: u32,
    schedule: Option<cron::Schedule>,
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine").finish_non_exhaustive()
    }
}

impl SnapshotEngine {
    pub fn new(
        local: Arc<LocalStore>,
        stores: crate::SharedStores,
        clock: Arc<MonotonicClock>,
        mode_rx: watch::Receiver<ModeState>,
        retention_days: u32,
        schedule: Option<&str>,
    ) -> Result<Arc<Self>> {
        let schedule = schedule
            .map(|spec| {
                cron::Schedule::from_str(spec).map_err(|_| SyncError::InvalidConfig {
                    missing: vec![format!("BACKUP_SCHEDULE: invalid cron spec {spec:?}")],
                })
            })
            .transpose()?;

        Ok(Arc::new(Self {
            local,
            stores,
            clock,
            mode_rx,
            retention_days,
            schedule,
        }))
    }

    async fn object(&self) -> Result<Arc<ObjectStoreAdapter>> {
        self.stores
            .read()
            .await
            .object
            .clone()
            .ok_or_else(|| SyncError::PeerUnreachable("object store not configured".into()))
    }

    /// Take a snapshot through the currently configured object store.
    pub async fn create_backup(&self) -> Result<BackupManifest> {
        let object = self.object().await?;
        self.create_backup_with(&object).await
    }

    /// Take a snapshot through an explicit object store; transitions use
    /// this before the new configuration is swapped in.
    pub async fn create_backup_with(
        &self,
        object: &ObjectStoreAdapter,
    ) -> Result<BackupManifest> {
        let db_bytes = {
            let _fence = self.local.write_barrier().await;
            self.local.checkpoint().await?;
            tokio::fs::read(self.local.db_path()).await?
        };

        let archive = tokio::task::spawn_blocking(move || {
            build_archive(vec![(DB_ENTRY.to_string(), db_bytes)])
        })
        .await
        .map_err(|e| SyncError::Internal(e.to_string()))??;

        let content_hash = hex::encode(Sha256::digest(&archive));
        let manifest = BackupManifest::new(
            self.clock.now_millis(),
            self.mode_rx.borrow().current,
            object.bucket(),
            content_hash,
            archive.len() as u64,
        );

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        object.put_bytes(&manifest.archive_key(), archive).await?;
        object.put_bytes(&manifest.manifest_key(), manifest_json).await?;

        tracing::info!(
            prefix = %manifest.prefix,
            size_bytes = manifest.size_bytes,
            "snapshot uploaded"
        );
        Ok(manifest)
    }

    /// All stored manifests, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let object = self.object().await?;
        let mut manifests = Vec::new();
        for key in object.list_keys("backups").await? {
            if !key.ends_with("/manifest.json") {
                continue;
            }
            let Some(bytes) = object.get_bytes(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<BackupManifest>(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => tracing::warn!(key, error = %e, "skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| b.backup_date.cmp(&a.backup_date));
        Ok(manifests)
    }

    /// Restore the snapshot taken at `backup_id` (a `yyyymmdd_HHMMSS`
    /// stamp). The archive hash is verified before the local store is
    /// touched; on mismatch the restore aborts with `CorruptSnapshot` and
    /// the store is left as it was.
    pub async fn restore(&self, backup_id: &str) -> Result<RestoreOutcome> {
        let object = self.object().await?;

        let manifest_key = format!("backups/{backup_id}/manifest.json");
        let manifest_bytes = object
            .get_bytes(&manifest_key)
            .await?
            .ok_or_else(|| SyncError::BackupNotFound(backup_id.to_string()))?;
        let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| SyncError::CorruptSnapshot(format!("unreadable manifest: {e}")))?;

        let archive = object
            .get_bytes(&manifest.archive_key())
            .await?
            .ok_or_else(|| SyncError::BackupNotFound(manifest.archive_key()))?;

        manifest
            .verify(&archive)
            .map_err(|e| SyncError::CorruptSnapshot(e.to_string()))?;

        let db_bytes = tokio::task::spawn_blocking(move || extract_entry(&archive, DB_ENTRY))
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))??
            .ok_or_else(|| {
                SyncError::CorruptSnapshot(format!("archive has no {DB_ENTRY} entry"))
            })?;

        self.local.replace_database(&db_bytes).await?;

        tracing::info!(backup_id, "local store restored from snapshot");
        Ok(RestoreOutcome {
            manifest,
            restart_required: true,
        })
    }

    /// Delete snapshots older than the retention window.
    pub async fn enforce_retention(&self) -> Result<usize> {
        let object = self.object().await?;
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        let cutoff = cutoff.format("%Y%m%d_%H%M%S").to_string();

        let mut removed = 0;
        for manifest in self.list_backups().await? {
            if manifest.backup_date >= cutoff {
                continue;
            }
            object.delete_key(&manifest.archive_key()).await?;
            object.delete_key(&manifest.manifest_key()).await?;
            removed += 1;
            tracing::debug!(prefix = %manifest.prefix, "expired snapshot removed");
        }
        Ok(removed)
    }

    /// The scheduled snapshot loop. Without a schedule the task idles until
    /// cancelled; on-demand backups stay available either way.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(schedule) = self.schedule.clone() else {
            cancel.cancelled().await;
            return;
        };

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                break;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if !self.mode_rx.borrow().current.includes_object() {
                tracing::debug!("scheduled snapshot skipped: no object store in current mode");
                continue;
            }
            if let Err(e) = self.create_backup().await {
                tracing::warn!(error = %e, "scheduled snapshot failed");
                continue;
            }
            if let Err(e) = self.enforce_retention().await {
                tracing::warn!(error = %e, "retention sweep failed");
            }
        }
    }
}

fn build_archive(files: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn extract_entry(archive: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    let decoder = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}
