//! Per-data-type sync policies and the ground-truth policy table.
//!
//! The built-in table is the authority; mode-specific overrides derive an
//! effective table from it at runtime. Policies are immutable between mode
//! transitions.

use crate::{DataType, DeploymentMode};
use serde::{Deserialize, Serialize};

/// How records of a type move between stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Bidirectional reconciliation with conflict resolution
    FullDuplex,
    /// Destination always accepts source (template distribution)
    MasterSlave,
    /// Source to object store, append-only, no conflict check
    BackupOnly,
    /// Interval is a ceiling; runs are scoped by the hot set
    OnDemand,
    /// Never leaves the local store
    LocalOnly,
}

/// One direction of record flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToExternal,
    ExternalToLocal,
}

impl SyncDirection {
    /// Stable name used in cursor keys and status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::LocalToExternal => "local_to_external",
            SyncDirection::ExternalToLocal => "external_to_local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local_to_external" => Some(SyncDirection::LocalToExternal),
            "external_to_local" => Some(SyncDirection::ExternalToLocal),
            _ => None,
        }
    }
}

/// The sync policy for one data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub enabled: bool,
    pub directions: Vec<SyncDirection>,
    pub interval_seconds: u64,
    pub batch_size: usize,
    pub strategy: SyncStrategy,
    /// Payloads of sensitive types are encrypted before leaving the process.
    pub sensitive: bool,
}

impl SyncPolicy {
    fn disabled() -> Self {
        Self {
            enabled: false,
            directions: Vec::new(),
            interval_seconds: 0,
            batch_size: 0,
            strategy: SyncStrategy::LocalOnly,
            sensitive: false,
        }
    }
}

const BOTH: [SyncDirection; 2] = [
    SyncDirection::LocalToExternal,
    SyncDirection::ExternalToLocal,
];
const PUSH: [SyncDirection; 1] = [SyncDirection::LocalToExternal];

/// The per-data-type policy table.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRegistry {
    entries: Vec<(DataType, SyncPolicy)>,
}

impl PolicyRegistry {
    /// The built-in ground-truth table.
    pub fn builtin() -> Self {
        fn policy(
            directions: &[SyncDirection],
            interval_seconds: u64,
            batch_size: usize,
            strategy: SyncStrategy,
            sensitive: bool,
        ) -> SyncPolicy {
            SyncPolicy {
                enabled: true,
                directions: directions.to_vec(),
                interval_seconds,
                batch_size,
                strategy,
                sensitive,
            }
        }

        let entries = vec![
            (
                DataType::Users,
                policy(&BOTH, 60, 50, SyncStrategy::FullDuplex, true),
            ),
            (
                DataType::SystemConfigs,
                policy(&BOTH, 30, 20, SyncStrategy::FullDuplex, true),
            ),
            (
                DataType::AiProviderConfigs,
                policy(&BOTH, 30, 20, SyncStrategy::FullDuplex, true),
            ),
            (
                DataType::Projects,
                policy(&BOTH, 300, 20, SyncStrategy::FullDuplex, false),
            ),
            (
                DataType::TodoData,
                policy(&BOTH, 300, 30, SyncStrategy::FullDuplex, false),
            ),
            (
                DataType::SlideData,
                policy(&PUSH, 1800, 10, SyncStrategy::OnDemand, false),
            ),
            (
                DataType::PptTemplates,
                policy(&BOTH, 1800, 15, SyncStrategy::MasterSlave, false),
            ),
            (
                DataType::GlobalTemplates,
                policy(&BOTH, 3600, 10, SyncStrategy::MasterSlave, false),
            ),
            (
                DataType::ProjectVersions,
                policy(&PUSH, 3600, 5, SyncStrategy::BackupOnly, false),
            ),
            (DataType::UserSessions, SyncPolicy::disabled()),
        ];

        Self { entries }
    }

    /// Look up the policy for a data type.
    pub fn policy(&self, data_type: DataType) -> &SyncPolicy {
        self.entries
            .iter()
            .find(|(t, _)| *t == data_type)
            .map(|(_, p)| p)
            .expect("every data type has a table entry")
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (DataType, &SyncPolicy)> {
        self.entries.iter().map(|(t, p)| (*t, p))
    }

    /// Derive the effective table for a deployment mode.
    ///
    /// - `LOCAL_ONLY`: everything that would leave the local store is
    ///   disabled.
    /// - `LOCAL_EXTERNAL`: backup-only types have no object sink and are
    ///   disabled.
    /// - `LOCAL_R2`: non-critical full-duplex types downgrade to backup-only
    ///   with the object store as sink; strategies that need the external
    ///   peer (master-slave, on-demand) are disabled. Critical types keep
    ///   their full-duplex policy; without an external peer no worker spawns
    ///   for them.
    /// - `LOCAL_EXTERNAL_R2`: the table as-is.
    pub fn for_mode(&self, mode: DeploymentMode) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(t, p)| {
                let mut p = p.clone();
                if !p.enabled {
                    return (*t, p);
                }
                match mode {
                    DeploymentMode::LocalOnly => {
                        p.enabled = false;
                    }
                    DeploymentMode::LocalExternal => {
                        if p.strategy == SyncStrategy::BackupOnly {
                            p.enabled = false;
                        }
                    }
                    DeploymentMode::LocalR2 => match p.strategy {
                        SyncStrategy::FullDuplex if !t.is_critical() => {
                            p.strategy = SyncStrategy::BackupOnly;
                            p.directions = PUSH.to_vec();
                        }
                        SyncStrategy::MasterSlave | SyncStrategy::OnDemand => {
                            p.enabled = false;
                        }
                        _ => {}
                    },
                    DeploymentMode::LocalExternalR2 => {}
                }
                (*t, p)
            })
            .collect();

        Self { entries }
    }

    /// Apply environment overrides: a global interval floor for non-critical
    /// types and a direction restriction.
    pub fn apply_overrides(
        &mut self,
        interval_seconds: Option<u64>,
        directions: Option<&[SyncDirection]>,
    ) {
        for (t, p) in &mut self.entries {
            if let Some(interval) = interval_seconds {
                if !t.is_critical() && p.enabled {
                    p.interval_seconds = interval;
                }
            }
            if let Some(allowed) = directions {
                p.directions.retain(|d| allowed.contains(d));
                if p.directions.is_empty() && p.strategy != SyncStrategy::BackupOnly {
                    p.enabled = false;
                }
            }
        }
    }

    /// The longest interval of any enabled policy, in seconds. Tombstones
    /// must be retained at least this long so deletions propagate before
    /// garbage collection.
    pub fn longest_active_interval(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(_, p)| p.interval_seconds)
            .max()
            .unwrap_or(0)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_matches_ground_truth() {
        let registry = PolicyRegistry::builtin();

        let users = registry.policy(DataType::Users);
        assert!(users.enabled);
        assert_eq!(users.interval_seconds, 60);
        assert_eq!(users.batch_size, 50);
        assert_eq!(users.strategy, SyncStrategy::FullDuplex);
        assert!(users.sensitive);
        assert_eq!(users.directions.len(), 2);

        let slides = registry.policy(DataType::SlideData);
        assert_eq!(slides.strategy, SyncStrategy::OnDemand);
        assert_eq!(slides.directions, vec![SyncDirection::LocalToExternal]);

        let sessions = registry.policy(DataType::UserSessions);
        assert!(!sessions.enabled);
        assert_eq!(sessions.strategy, SyncStrategy::LocalOnly);
    }

    #[test]
    fn local_only_disables_everything() {
        let effective = PolicyRegistry::builtin().for_mode(DeploymentMode::LocalOnly);
        for (_, p) in effective.iter() {
            assert!(!p.enabled);
        }
    }

    #[test]
    fn local_external_disables_backup_only() {
        let effective = PolicyRegistry::builtin().for_mode(DeploymentMode::LocalExternal);
        assert!(!effective.policy(DataType::ProjectVersions).enabled);
        assert!(effective.policy(DataType::Users).enabled);
        assert!(effective.policy(DataType::PptTemplates).enabled);
    }

    #[test]
    fn local_r2_downgrades_non_critical_duplex() {
        let effective = PolicyRegistry::builtin().for_mode(DeploymentMode::LocalR2);

        let projects = effective.policy(DataType::Projects);
        assert!(projects.enabled);
        assert_eq!(projects.strategy, SyncStrategy::BackupOnly);
        assert_eq!(projects.directions, vec![SyncDirection::LocalToExternal]);

        // Critical types keep their policy.
        assert_eq!(
            effective.policy(DataType::Users).strategy,
            SyncStrategy::FullDuplex
        );

        // Strategies that need the external peer are off.
        assert!(!effective.policy(DataType::PptTemplates).enabled);
        assert!(!effective.policy(DataType::SlideData).enabled);
    }

    #[test]
    fn full_mode_keeps_table_as_is() {
        let builtin = PolicyRegistry::builtin();
        let effective = builtin.for_mode(DeploymentMode::LocalExternalR2);
        assert_eq!(builtin, effective);
    }

    #[test]
    fn interval_override_spares_critical_types() {
        let mut registry = PolicyRegistry::builtin();
        registry.apply_overrides(Some(120), None);

        assert_eq!(registry.policy(DataType::Projects).interval_seconds, 120);
        assert_eq!(registry.policy(DataType::Users).interval_seconds, 60);
        assert_eq!(
            registry.policy(DataType::SystemConfigs).interval_seconds,
            30
        );
    }

    #[test]
    fn direction_restriction_disables_emptied_policies() {
        let mut registry = PolicyRegistry::builtin();
        registry.apply_overrides(None, Some(&[SyncDirection::ExternalToLocal]));

        // users keeps the pull direction
        let users = registry.policy(DataType::Users);
        assert!(users.enabled);
        assert_eq!(users.directions, vec![SyncDirection::ExternalToLocal]);

        // slide_data only pushed; restricted away, so disabled
        assert!(!registry.policy(DataType::SlideData).enabled);
    }

    #[test]
    fn longest_interval_covers_tombstone_retention() {
        let registry = PolicyRegistry::builtin();
        assert_eq!(registry.longest_active_interval(), 3600);

        let local_only = registry.for_mode(DeploymentMode::LocalOnly);
        assert_eq!(local_only.longest_active_interval(), 0);
    }

    #[test]
    fn direction_names_round_trip() {
        for d in [SyncDirection::LocalToExternal, SyncDirection::ExternalToLocal] {
            assert_eq!(SyncDirection::parse(d.as_str()), Some(d));
        }
        assert_eq!(SyncDirection::parse("sideways"), None);
    }
}
