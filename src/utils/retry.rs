//! Backoff math shared by saga step retries and outbox redelivery.
//!
//! Saga steps retry in-process with `delay × multiplier^attempt`. Outbox
//! rows retry through the durable `retry_after` column with `base × 2^n`,
//! capped so a poisoned row cannot push its own redelivery out forever.

use std::time::Duration;

/// Per-step retry behavior.
#[derive(Debug, Clone)]
pub struct StepRetryConfig {
    /// Maximum number of retry attempts (0 = single attempt, no backoff).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplier applied to the delay for each subsequent retry.
    pub backoff_multiplier: f64,
}

impl Default for StepRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

impl StepRetryConfig {
    /// Delay before retry number `attempt` (0-indexed): `delay × multiplier^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.delay.as_millis() as f64;
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(30) as i32);
        let ms = (base_ms * factor).min(Duration::from_secs(3600).as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Whether another attempt should be made after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Durable redelivery backoff: `base × 2^retry_count`, capped at `max`.
///
/// `retry_count` is the count *after* incrementing for the failure being
/// recorded, matching the durable column.
pub fn redelivery_backoff(base: Duration, retry_count: u32, max: Duration) -> Duration {
    let shifted = base
        .as_millis()
        .saturating_mul(1u128 << retry_count.min(30) as u128);
    Duration::from_millis(shifted.min(max.as_millis()) as u64)
}
