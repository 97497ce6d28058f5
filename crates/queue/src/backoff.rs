use std::time::Duration;

/// `base * 2^attempt`, saturating, capped at `max`.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Retry delay that doubles on every failure until `max`.
///
/// `reset` after a success so the next failure starts from `base` again.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, attempt: 0 } }

    pub fn next_delay(&mut self) -> Duration {
        let delay = exponential(self.base, self.max, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) { self.attempt = 0; }
    pub fn attempts(&self) -> u32 { self.attempt }
}
