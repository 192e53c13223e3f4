//! Bounded exponential backoff for collaborator calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::Transient;

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Up to 25% extra on top of `delay`.
fn with_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..0.25);
    delay + delay.mul_f64(extra)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors reporting [`Transient::is_transient`] are retried. A
/// server-suggested `retry_after` replaces the computed delay.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < max_attempts => {
                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| with_jitter(policy.delay_for(attempt)))
                    .min(policy.max_delay.max(policy.base_delay));
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay = ?delay,
                    error = %error,
                    "Transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
