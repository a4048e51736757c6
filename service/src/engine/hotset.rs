//! The hot set: project ids accessed recently, used to scope on-demand sync.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default working-set window.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Recently-accessed record ids with per-id expiry.
pub struct HotSet {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl HotSet {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record an access, refreshing the id's expiry.
    pub fn record_access(&self, id: impl Into<String>) {
        self.entries.insert(id.into(), Instant::now());
    }

    /// Whether the id was accessed within the window.
    pub fn contains(&self, id: &str) -> bool {
        match self.entries.get(id) {
            Some(entry) => entry.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Whether anything is hot. Expired entries are pruned on the way.
    pub fn is_empty(&self) -> bool {
        self.entries.retain(|_, at| at.elapsed() < self.ttl);
        self.entries.is_empty()
    }

    /// Number of hot ids.
    pub fn len(&self) -> usize {
        self.entries.retain(|_, at| at.elapsed() < self.ttl);
        self.entries.len()
    }
}

impl Default for HotSet {
    fn default() -> Self {
        Self::new()
    }
}
