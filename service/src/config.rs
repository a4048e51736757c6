//! Configuration management for the service.
//!
//! Everything is loaded once from the environment into an owned [`Config`]
//! and injected into components; nothing reads the environment afterwards.
//! Mode transitions carry a [`PeerConfig`] with replacement peer settings.

use flowsync_core::{DataType, DeploymentMode, SyncDirection};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default number of days snapshots are retained in the object store.
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default external connection pool size.
const DEFAULT_EXTERNAL_CONNECTIONS: u32 = 10;

/// Object-store credentials; all four must be present to enable R2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    pub bucket: String,
}

/// A 256-bit key for sensitive payload encryption. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(pub [u8; 32]);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| ConfigError::InvalidValue("SYNC_ENCRYPTION_KEY"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidValue("SYNC_ENCRYPTION_KEY"))?;
        Ok(Self(key))
    }
}

/// One AI provider's credentials and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSetting {
    pub name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Environment-provided settings mirrored by the config sync service so a
/// new replica inherits them on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSettings {
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub jwt_secret: Option<String>,
    pub captcha_site_key: Option<String>,
    pub captcha_secret_key: Option<String>,
    pub max_upload_mb: Option<u64>,
    pub enable_login_captcha: Option<bool>,
    pub providers: Vec<ProviderSetting>,
}

/// Peer selection carried by a mode transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub database_url: Option<String>,
    pub r2: Option<R2Config>,
}

impl PeerConfig {
    /// Fields the target mode requires but this config does not carry.
    pub fn missing_fields(&self, target: DeploymentMode) -> Vec<String> {
        let mut missing = Vec::new();
        if target.includes_external() && self.database_url.is_none() {
            missing.push("DATABASE_URL".to_string());
        }
        if target.includes_object() && self.r2.is_none() {
            missing.extend(
                ["R2_ACCESS_KEY_ID", "R2_SECRET_ACCESS_KEY", "R2_ENDPOINT", "R2_BUCKET_NAME"]
                    .map(String::from),
            );
        }
        missing
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the local store file
    pub data_dir: PathBuf,
    /// Stable identity of this replica
    pub node_id: String,
    /// External relational peer; presence enables EXTERNAL
    pub database_url: Option<String>,
    /// Object store credentials; presence enables R2
    pub r2: Option<R2Config>,
    /// Master on/off for the sync engine
    pub enable_data_sync: bool,
    /// Interval override for non-critical types, seconds
    pub sync_interval: Option<u64>,
    /// Direction restriction
    pub sync_directions: Option<Vec<SyncDirection>>,
    /// cron spec (with seconds field) for scheduled snapshots
    pub backup_schedule: Option<String>,
    /// Retention horizon for snapshots, days
    pub backup_retention_days: u32,
    /// Pinned mode; disables detection when set
    pub mode_override: Option<DeploymentMode>,
    /// Key for sensitive payload encryption
    pub encryption_key: Option<EncryptionKey>,
    /// Bound on concurrently running workers / external-store calls
    pub max_parallel: Option<usize>,
    /// External connection pool cap
    pub external_max_connections: u32,
    /// Settings mirrored by the config sync service
    pub settings: EnvSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = env::var("FLOWSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let node_id = env::var("FLOWSYNC_NODE_ID")
            .unwrap_or_else(|_| flowsync_core::clock::generate_id());

        let database_url = non_empty(env::var("DATABASE_URL").ok());

        let r2 = load_r2()?;

        let enable_data_sync = match env::var("ENABLE_DATA_SYNC") {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::InvalidValue("ENABLE_DATA_SYNC"))?,
            Err(_) => true,
        };

        let sync_interval = env::var("SYNC_INTERVAL")
            .ok()
            .map(|v| v.parse().map_err(|_| ConfigError::InvalidValue("SYNC_INTERVAL")))
            .transpose()?;

        let sync_directions = env::var("SYNC_DIRECTIONS")
            .ok()
            .map(|v| parse_directions(&v))
            .transpose()?;

        let backup_schedule = non_empty(env::var("BACKUP_SCHEDULE").ok());

        let backup_retention_days = env::var("BACKUP_RETENTION_DAYS")
            .ok()
            .map(|v| {
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("BACKUP_RETENTION_DAYS"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        let mode_override = env::var("DEPLOYMENT_MODE")
            .ok()
            .map(|v| {
                DeploymentMode::from_str(&v).map_err(|_| ConfigError::InvalidValue("DEPLOYMENT_MODE"))
            })
            .transpose()?;

        let encryption_key = env::var("SYNC_ENCRYPTION_KEY")
            .ok()
            .map(|v| EncryptionKey::from_hex(&v))
            .transpose()?;

        let max_parallel = env::var("SYNC_MAX_PARALLEL")
            .ok()
            .map(|v| v.parse().map_err(|_| ConfigError::InvalidValue("SYNC_MAX_PARALLEL")))
            .transpose()?;

        let external_max_connections = env::var("EXTERNAL_MAX_CONNECTIONS")
            .ok()
            .map(|v| {
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("EXTERNAL_MAX_CONNECTIONS"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_EXTERNAL_CONNECTIONS);

        Ok(Self {
            data_dir,
            node_id,
            database_url,
            r2,
            enable_data_sync,
            sync_interval,
            sync_directions,
            backup_schedule,
            backup_retention_days,
            mode_override,
            encryption_key,
            max_parallel,
            external_max_connections,
            settings: load_settings(),
        })
    }

    /// Path of the local store file.
    pub fn local_db_path(&self) -> PathBuf {
        self.data_dir.join("flowsync.db")
    }

    /// The peers this configuration selects.
    pub fn peers(&self) -> PeerConfig {
        PeerConfig {
            database_url: self.database_url.clone(),
            r2: self.r2.clone(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("incomplete R2 credentials, missing: {}", missing.join(", "))]
    PartialR2 { missing: Vec<String> },
}

fn load_r2() -> Result<Option<R2Config>, ConfigError> {
    let keys = [
        "R2_ACCESS_KEY_ID",
        "R2_SECRET_ACCESS_KEY",
        "R2_ENDPOINT",
        "R2_BUCKET_NAME",
    ];
    let values: Vec<Option<String>> = keys
        .iter()
        .map(|k| non_empty(env::var(k).ok()))
        .collect();

    if values.iter().all(Option::is_none) {
        return Ok(None);
    }
    let missing: Vec<String> = keys
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::PartialR2 { missing });
    }

    let mut it = values.into_iter().flatten();
    Ok(Some(R2Config {
        access_key_id: it.next().unwrap(),
        secret_access_key: it.next().unwrap(),
        endpoint: it.next().unwrap(),
        bucket: it.next().unwrap(),
    }))
}

fn load_settings() -> EnvSettings {
    let providers = ["OPENAI", "ANTHROPIC", "GOOGLE"]
        .iter()
        .filter_map(|name| {
            let api_key = non_empty(env::var(format!("{name}_API_KEY")).ok());
            let base_url = non_empty(env::var(format!("{name}_BASE_URL")).ok());
            if api_key.is_none() && base_url.is_none() {
                return None;
            }
            Some(ProviderSetting {
                name: name.to_lowercase(),
                api_key,
                base_url,
            })
        })
        .collect();

    EnvSettings {
        admin_username: non_empty(env::var("DEFAULT_ADMIN_USERNAME").ok()),
        admin_password: non_empty(env::var("DEFAULT_ADMIN_PASSWORD").ok()),
        jwt_secret: non_empty(env::var("JWT_SECRET").ok()),
        captcha_site_key: non_empty(env::var("CAPTCHA_SITE_KEY").ok()),
        captcha_secret_key: non_empty(env::var("CAPTCHA_SECRET_KEY").ok()),
        max_upload_mb: env::var("MAX_UPLOAD_MB").ok().and_then(|v| v.parse().ok()),
        enable_login_captcha: env::var("ENABLE_LOGIN_CAPTCHA")
            .ok()
            .and_then(|v| parse_bool(&v)),
        providers,
    }
}

fn parse_directions(raw: &str) -> Result<Vec<SyncDirection>, ConfigError> {
    let mut directions = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let d =
            SyncDirection::parse(part).ok_or(ConfigError::InvalidValue("SYNC_DIRECTIONS"))?;
        if !directions.contains(&d) {
            directions.push(d);
        }
    }
    Ok(directions)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

/// The data types whose payloads the policy table marks sensitive.
pub fn sensitive_types() -> Vec<DataType> {
    flowsync_core::PolicyRegistry::builtin()
        .iter()
        .filter(|(_, p)| p.sensitive)
        .map(|(t, _)| t)
        .collect()
}
