//! Cache entries and the shared status store

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::ContainerStatus;

/// Last known status of one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub container: String,
    pub status: ContainerStatus,
    pub captured_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
    /// Set when served past its TTL or after a failed refresh
    pub stale: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl_expires_at
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.stale && !self.is_expired(now)
    }

    /// Still servable as stale: not past TTL + grace
    pub fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.ttl_expires_at
            .checked_add_signed(to_chrono(grace))
            .map(|limit| now < limit)
            .unwrap_or(true)
    }

    /// Copy of this entry flagged stale
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or_default()
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Shared map of container name to cache entry
///
/// The dispatcher writes results here; the status cache reads and evicts.
/// Writes for one container are serialised by the dispatcher's per-container
/// token for mutating actions, and `captured_at` never moves backwards.
#[derive(Debug, Default)]
pub struct StatusStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, container: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(container)
            .cloned()
    }

    /// Store a successful fetch; older captures never replace newer ones
    pub fn record_success(
        &self,
        container: &str,
        status: ContainerStatus,
        captured_at: DateTime<Utc>,
        ttl: Duration,
    ) -> CacheEntry {
        debug!(%container, state = %status.state, "StatusStore::record_success: called");
        let ttl = to_chrono(ttl.max(Duration::from_millis(1)));
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = entries.get(container) {
            if existing.captured_at > captured_at {
                debug!(%container, "StatusStore::record_success: newer capture already stored");
                return existing.clone();
            }
        }

        let entry = CacheEntry {
            container: container.to_string(),
            status,
            captured_at,
            ttl_expires_at: captured_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            stale: false,
        };
        entries.insert(container.to_string(), entry.clone());
        entry
    }

    /// Flag the entry stale after a failed or timed-out refresh
    pub fn mark_stale(&self, container: &str) -> bool {
        debug!(%container, "StatusStore::mark_stale: called");
        match self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(container)
        {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Keep only entries matching `keep`; returns the number dropped
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| keep(entry));
        before - entries.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerState;

    fn running() -> ContainerStatus {
        ContainerStatus::new(ContainerState::Running)
    }

    #[test]
    fn test_ttl_after_capture() {
        let store = StatusStore::new();
        let now = Utc::now();

        let entry = store.record_success("web", running(), now, Duration::from_secs(30));
        assert!(entry.ttl_expires_at > entry.captured_at);

        // Zero TTL still yields an expiry after capture
        let entry = store.record_success("db", running(), now, Duration::ZERO);
        assert!(entry.ttl_expires_at > entry.captured_at);
    }

    #[test]
    fn test_older_capture_does_not_replace_newer() {
        let store = StatusStore::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);

        store.record_success("web", running(), now, Duration::from_secs(30));
        let kept = store.record_success(
            "web",
            ContainerStatus::new(ContainerState::Exited),
            earlier,
            Duration::from_secs(30),
        );

        assert_eq!(kept.captured_at, now);
        assert_eq!(store.get("web").unwrap().status.state, ContainerState::Running);
    }

    #[test]
    fn test_mark_stale_and_refresh_clears() {
        let store = StatusStore::new();
        let now = Utc::now();
        store.record_success("web", running(), now, Duration::from_secs(30));

        assert!(store.mark_stale("web"));
        assert!(store.get("web").unwrap().stale);
        assert!(!store.mark_stale("unknown"));

        let entry = store.record_success("web", running(), now + chrono::Duration::seconds(1), Duration::from_secs(30));
        assert!(!entry.stale);
    }

    #[test]
    fn test_freshness_and_grace() {
        let store = StatusStore::new();
        let now = Utc::now();
        let entry = store.record_success("web", running(), now, Duration::from_secs(10));

        assert!(entry.is_fresh(now + chrono::Duration::seconds(5)));
        assert!(!entry.is_fresh(now + chrono::Duration::seconds(10)));
        assert!(entry.within_grace(now + chrono::Duration::seconds(15), Duration::from_secs(10)));
        assert!(!entry.within_grace(now + chrono::Duration::seconds(20), Duration::from_secs(10)));
    }

    #[test]
    fn test_retain() {
        let store = StatusStore::new();
        let now = Utc::now();
        store.record_success("web", running(), now, Duration::from_secs(10));
        store.record_success("db", running(), now, Duration::from_secs(10));

        let dropped = store.retain(|e| e.container == "web");
        assert_eq!(dropped, 1);
        assert_eq!(store.names(), vec!["web".to_string()]);
    }
}
