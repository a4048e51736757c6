//! Immutable log entries for deployment-mode transitions.

use crate::{DeploymentMode, Timestamp};
use serde::{Deserialize, Serialize};

/// Terminal state of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Succeeded,
    RolledBack,
    Failed,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::Succeeded => "succeeded",
            TransitionStatus::RolledBack => "rolled_back",
            TransitionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(TransitionStatus::Succeeded),
            "rolled_back" => Some(TransitionStatus::RolledBack),
            "failed" => Some(TransitionStatus::Failed),
            _ => None,
        }
    }
}

/// One entry in the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from_mode: DeploymentMode,
    pub to_mode: DeploymentMode,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub status: TransitionStatus,
    pub reason: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Prefix of the pre-transition snapshot, when one was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_prefix: Option<String>,
}

impl TransitionRecord {
    /// Start a new attempt.
    pub fn begin(
        from_mode: DeploymentMode,
        to_mode: DeploymentMode,
        started_at: Timestamp,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            from_mode,
            to_mode,
            started_at,
            finished_at: None,
            status: TransitionStatus::Failed,
            reason: reason.into(),
            actor: actor.into(),
            error: None,
            snapshot_prefix: None,
        }
    }

    /// Mark the attempt finished.
    pub fn finish(
        mut self,
        status: TransitionStatus,
        finished_at: Timestamp,
        error: Option<String>,
    ) -> Self {
        self.status = status;
        self.finished_at = Some(finished_at);
        self.error = error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_finish() {
        let record = TransitionRecord::begin(
            DeploymentMode::LocalOnly,
            DeploymentMode::LocalExternalR2,
            1000,
            "promote",
            "operator",
        );
        assert_eq!(record.from_mode, DeploymentMode::LocalOnly);
        assert!(record.finished_at.is_none());

        let done = record.finish(TransitionStatus::Succeeded, 2000, None);
        assert_eq!(done.status, TransitionStatus::Succeeded);
        assert_eq!(done.finished_at, Some(2000));
        assert!(done.error.is_none());
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            TransitionStatus::Succeeded,
            TransitionStatus::RolledBack,
            TransitionStatus::Failed,
        ] {
            assert_eq!(TransitionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransitionStatus::parse("maybe"), None);
    }

    #[test]
    fn serialization() {
        let record = TransitionRecord::begin(
            DeploymentMode::LocalExternal,
            DeploymentMode::LocalExternalR2,
            1000,
            "add object store",
            "control-api",
        )
        .finish(TransitionStatus::RolledBack, 2000, Some("probe failed".into()));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"rolled_back\""));
        assert!(json.contains("\"fromMode\":\"LOCAL_EXTERNAL\""));
        let parsed: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
