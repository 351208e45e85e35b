//! Exponential backoff for transient failures

use std::time::Duration;

use rand::Rng;

/// Backoff policy: `base * 2^attempt`, capped, with up to 25% random jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max: Duration::from_secs(10),
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max);
        let jitter_ms = (capped.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        (capped + Duration::from_millis(jitter)).min(self.max)
    }
}
