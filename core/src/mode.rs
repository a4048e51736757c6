//! Deployment modes and the detection decision table.
//!
//! The mode is derived from which peers are configured and reachable. It is
//! never stored authoritatively; the detector recomputes it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The topology of stores currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentMode {
    LocalOnly,
    LocalExternal,
    LocalR2,
    LocalExternalR2,
}

impl DeploymentMode {
    /// The decision table: external reachable x object store reachable.
    pub fn from_reachability(external: bool, object: bool) -> Self {
        match (external, object) {
            (false, false) => DeploymentMode::LocalOnly,
            (true, false) => DeploymentMode::LocalExternal,
            (false, true) => DeploymentMode::LocalR2,
            (true, true) => DeploymentMode::LocalExternalR2,
        }
    }

    /// Whether this mode includes the external relational peer.
    pub fn includes_external(&self) -> bool {
        matches!(
            self,
            DeploymentMode::LocalExternal | DeploymentMode::LocalExternalR2
        )
    }

    /// Whether this mode includes the S3-compatible object store.
    pub fn includes_object(&self) -> bool {
        matches!(self, DeploymentMode::LocalR2 | DeploymentMode::LocalExternalR2)
    }

    /// Canonical SCREAMING_SNAKE_CASE name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::LocalOnly => "LOCAL_ONLY",
            DeploymentMode::LocalExternal => "LOCAL_EXTERNAL",
            DeploymentMode::LocalR2 => "LOCAL_R2",
            DeploymentMode::LocalExternalR2 => "LOCAL_EXTERNAL_R2",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOCAL_ONLY" => Ok(DeploymentMode::LocalOnly),
            "LOCAL_EXTERNAL" => Ok(DeploymentMode::LocalExternal),
            "LOCAL_R2" => Ok(DeploymentMode::LocalR2),
            "LOCAL_EXTERNAL_R2" => Ok(DeploymentMode::LocalExternalR2),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}
