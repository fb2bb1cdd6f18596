//! Exponential backoff policy shared by delivery retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for re-delivering a turn after a failed attempt.
/// `delay_for(n)` doubles per attempt, so the defaults yield 2s, 4s, 8s.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }
}
