//! Backup manifests stored alongside snapshot archives in the object store.
//!
//! The JSON key set is part of the on-disk contract; tooling outside this
//! crate parses these manifests.

use crate::{DeploymentMode, Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Which slices of the local store a snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotComponents {
    pub database: bool,
    pub project_data: bool,
    pub templates: bool,
    pub configs: bool,
}

impl SnapshotComponents {
    /// A whole-store snapshot.
    pub fn full() -> Self {
        Self {
            database: true,
            project_data: true,
            templates: true,
            configs: true,
        }
    }
}

/// Manifest describing one snapshot archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// `yyyymmdd_HHMMSS`, also the key segment of the backup prefix.
    pub backup_date: String,
    /// ISO-8601 UTC timestamp of the snapshot.
    pub backup_timestamp: String,
    /// Deployment mode at snapshot time.
    pub mode: DeploymentMode,
    /// Included data slices.
    pub components: SnapshotComponents,
    /// Bucket holding the archive.
    pub bucket: String,
    /// Object prefix, `backups/<backup_date>/`.
    pub prefix: String,
    /// Hex SHA-256 of the archive bytes.
    pub content_hash: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

impl BackupManifest {
    /// Build a manifest for a snapshot taken at `at_millis`.
    pub fn new(
        at_millis: u64,
        mode: DeploymentMode,
        bucket: impl Into<String>,
        content_hash: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let when = timestamp_utc(at_millis);
        let backup_date = when.format("%Y%m%d_%H%M%S").to_string();
        let prefix = format!("backups/{backup_date}/");
        Self {
            backup_date,
            backup_timestamp: when.to_rfc3339_opts(SecondsFormat::Secs, true),
            mode,
            components: SnapshotComponents::full(),
            bucket: bucket.into(),
            prefix,
            content_hash: content_hash.into(),
            size_bytes,
        }
    }

    /// Key of the archive object.
    pub fn archive_key(&self) -> String {
        format!("{}archive.tar.gz", self.prefix)
    }

    /// Key of the manifest object.
    pub fn manifest_key(&self) -> String {
        format!("{}manifest.json", self.prefix)
    }

    /// Verify downloaded archive bytes against the recorded hash and size.
    pub fn verify(&self, archive: &[u8]) -> Result<()> {
        use sha2::{Digest, Sha256};

        if archive.len() as u64 != self.size_bytes {
            return Err(Error::InvalidManifest(format!(
                "archive size {} does not match declared {}",
                archive.len(),
                self.size_bytes
            )));
        }
        let actual = hex::encode(Sha256::digest(archive));
        if actual != self.content_hash {
            return Err(Error::InvalidManifest(format!(
                "content hash mismatch: expected {}, got {}",
                self.content_hash, actual
            )));
        }
        Ok(())
    }
}

fn timestamp_utc(at_millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(at_millis as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn manifest_keys_follow_layout() {
        // 2024-03-01T12:30:45Z
        let manifest = BackupManifest::new(
            1_709_296_245_000,
            DeploymentMode::LocalExternalR2,
            "flowsync-backups",
            "deadbeef",
            42,
        );

        assert_eq!(manifest.backup_date, "20240301_123045");
        assert_eq!(manifest.prefix, "backups/20240301_123045/");
        assert_eq!(manifest.archive_key(), "backups/20240301_123045/archive.tar.gz");
        assert_eq!(manifest.manifest_key(), "backups/20240301_123045/manifest.json");
        assert_eq!(manifest.backup_timestamp, "2024-03-01T12:30:45Z");
    }

    #[test]
    fn json_uses_contract_keys() {
        let manifest = BackupManifest::new(
            1_709_296_245_000,
            DeploymentMode::LocalR2,
            "bucket",
            "abc",
            10,
        );
        let json = serde_json::to_value(&manifest).unwrap();

        for key in [
            "backup_date",
            "backup_timestamp",
            "mode",
            "components",
            "bucket",
            "prefix",
            "content_hash",
            "size_bytes",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["mode"], "LOCAL_R2");
        assert_eq!(json["components"]["database"], true);
    }

    #[test]
    fn verify_accepts_matching_archive() {
        let archive = b"snapshot bytes".to_vec();
        let hash = hex::encode(Sha256::digest(&archive));
        let manifest = BackupManifest::new(
            0,
            DeploymentMode::LocalOnly,
            "b",
            hash,
            archive.len() as u64,
        );
        assert!(manifest.verify(&archive).is_ok());
    }

    #[test]
    fn verify_rejects_corruption() {
        let archive = b"snapshot bytes".to_vec();
        let hash = hex::encode(Sha256::digest(&archive));
        let manifest = BackupManifest::new(
            0,
            DeploymentMode::LocalOnly,
            "b",
            hash,
            archive.len() as u64,
        );

        let mut tampered = archive.clone();
        tampered[0] ^= 0xff;
        assert!(manifest.verify(&tampered).is_err());

        let truncated = &archive[..4];
        assert!(manifest.verify(truncated).is_err());
    }

    #[test]
    fn round_trip() {
        let manifest = BackupManifest::new(
            1_709_296_245_000,
            DeploymentMode::LocalExternal,
            "bucket",
            "hash",
            7,
        );
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: BackupManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, parsed);
    }
}
