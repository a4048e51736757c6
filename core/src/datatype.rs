//! The closed set of data types the core synchronizes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named class of records with a fixed sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Users,
    Projects,
    TodoData,
    SlideData,
    PptTemplates,
    GlobalTemplates,
    ProjectVersions,
    UserSessions,
    SystemConfigs,
    AiProviderConfigs,
}

impl DataType {
    /// Every recognized data type, in policy-table order.
    pub const ALL: [DataType; 10] = [
        DataType::Users,
        DataType::SystemConfigs,
        DataType::AiProviderConfigs,
        DataType::Projects,
        DataType::TodoData,
        DataType::SlideData,
        DataType::PptTemplates,
        DataType::GlobalTemplates,
        DataType::ProjectVersions,
        DataType::UserSessions,
    ];

    /// Critical types stay full-duplex in every mode with an external peer.
    pub const CRITICAL: [DataType; 3] = [
        DataType::Users,
        DataType::SystemConfigs,
        DataType::AiProviderConfigs,
    ];

    /// Stable snake_case name, used in storage keys and status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Users => "users",
            DataType::Projects => "projects",
            DataType::TodoData => "todo_data",
            DataType::SlideData => "slide_data",
            DataType::PptTemplates => "ppt_templates",
            DataType::GlobalTemplates => "global_templates",
            DataType::ProjectVersions => "project_versions",
            DataType::UserSessions => "user_sessions",
            DataType::SystemConfigs => "system_configs",
            DataType::AiProviderConfigs => "ai_provider_configs",
        }
    }

    /// Whether this type belongs to the critical set.
    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnknownDataType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_every_variant() {
        assert_eq!(DataType::ALL.len(), 10);
    }

    #[test]
    fn round_trip_names() {
        for t in DataType::ALL {
            assert_eq!(DataType::from_str(t.as_str()).unwrap(), t);
        }
    }

    #[test]
    fn unknown_name_rejected() {
        let err = DataType::from_str("widgets").unwrap_err();
        assert_eq!(err, Error::UnknownDataType("widgets".into()));
    }

    #[test]
    fn critical_set() {
        assert!(DataType::Users.is_critical());
        assert!(DataType::SystemConfigs.is_critical());
        assert!(DataType::AiProviderConfigs.is_critical());
        assert!(!DataType::Projects.is_critical());
        assert!(!DataType::UserSessions.is_critical());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&DataType::AiProviderConfigs).unwrap();
        assert_eq!(json, "\"ai_provider_configs\"");
        let parsed: DataType = serde_json::from_str("\"todo_data\"").unwrap();
        assert_eq!(parsed, DataType::TodoData);
    }
}
