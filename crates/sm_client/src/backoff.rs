//! Reconnect delay: base × 1.8^attempts, capped, plus bounded random jitter.

use std::time::Duration;

use rand::Rng;

const GROWTH: f64 = 1.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `attempts` earlier failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.capped(attempts) + Duration::from_millis(jitter)
    }

    /// Deterministic part of the delay.
    pub fn capped(&self, attempts: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let grown = base_ms * GROWTH.powi(attempts.min(64) as i32);
        let capped = grown.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
