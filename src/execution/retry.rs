//! Exponential Backoff
//!
//! Shared by the agent-local retry loop and the orchestration-level step
//! retry. The delay before retry `n` (0-based) is `base * 2^n`, capped.

use std::time::Duration;

/// Largest exponent applied to the base delay.
const MAX_SHIFT: u32 = 20;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a schedule; `max` is raised to `base` if smaller.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay to wait before the retry following `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }

        let multiplier = 1u128 << attempt.min(MAX_SHIFT);
        let delay_ms = base_ms.saturating_mul(multiplier).min(self.max.as_millis());
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Sleeps for [`Backoff::delay`] of `attempt`.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
