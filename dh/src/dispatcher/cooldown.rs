//! Per-container exclusion tokens for mutating actions
//!
//! A container's token is held by at most one running mutating request.
//! After release the container stays unavailable until its cooldown expires.
//! Idle entries are evicted so the map does not grow as containers come and go.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Stand-in for deadlines too far out for `Instant` to represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + span`, clamped to a far-future instant instead of overflowing
pub(crate) fn deadline_after(now: Instant, span: Duration) -> Instant {
    now.checked_add(span).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Clone)]
struct CooldownEntry {
    holder: Option<String>,
    available_at: Instant,
}

/// Map of container name to exclusion token
#[derive(Debug, Default)]
pub struct CooldownMap {
    entries: HashMap<String, CooldownEntry>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token free and cooldown over
    pub fn is_available(&self, container: &str, now: Instant) -> bool {
        match self.entries.get(container) {
            Some(entry) => entry.holder.is_none() && entry.available_at <= now,
            None => true,
        }
    }

    pub fn is_held(&self, container: &str) -> bool {
        self.entries
            .get(container)
            .map(|e| e.holder.is_some())
            .unwrap_or(false)
    }

    pub fn holder(&self, container: &str) -> Option<&str> {
        self.entries.get(container).and_then(|e| e.holder.as_deref())
    }

    /// Take the token for `request_id`; false if unavailable
    pub fn try_acquire(&mut self, container: &str, request_id: &str, now: Instant) -> bool {
        if !self.is_available(container, now) {
            return false;
        }
        self.entries.insert(
            container.to_string(),
            CooldownEntry {
                holder: Some(request_id.to_string()),
                available_at: now,
            },
        );
        true
    }

    /// Give the token back and start the cooldown window
    ///
    /// Ignored unless `request_id` holds the token.
    pub fn release(&mut self, container: &str, request_id: &str, cooldown: Duration, now: Instant) -> bool {
        match self.entries.get_mut(container) {
            Some(entry) if entry.holder.as_deref() == Some(request_id) => {
                entry.holder = None;
                entry.available_at = deadline_after(now, cooldown);
                true
            }
            _ => false,
        }
    }

    /// Earliest future instant at which an unheld container leaves cooldown
    pub fn next_expiry(&self, now: Instant) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.holder.is_none() && e.available_at > now)
            .map(|e| e.available_at)
            .min()
    }

    /// Drop entries with no holder whose cooldown has passed
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.holder.is_some() || e.available_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
