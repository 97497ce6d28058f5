use std::future::Future;
use std::time::Duration;

use rekon_core::RemoteError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bounded schedule for [`retry_on_conflict`]: `steps` attempts in total,
/// waiting `duration * factor^n` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self { Self { steps: 5, duration: Duration::from_millis(10), factor: 1.0 } }
}

impl RetryBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.duration.as_secs_f64() * self.factor.max(1.0).powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Run a get-mutate-update closure, re-running it while the write loses an
/// optimistic-concurrency race. Any other outcome is returned as is; after the
/// last step the final `Conflict` is returned.
pub async fn retry_on_conflict<T, F, Fut>(backoff: RetryBackoff, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < steps => {
                let delay = backoff.delay(attempt);
                debug!(attempt, ?delay, error = %e, "write conflict, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
