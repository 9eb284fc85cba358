//! Retry logic with exponential backoff for session establishment.
//!
//! Retries on connection-level errors (`ConnectError`, `AuthError`). Anything
//! else is returned on the first failure. Attempts are internal to the pool
//! and never show up as commands or audit entries.

use fleet_core::config::PoolConfig;
use fleet_core::FleetResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for each subsequent delay.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl From<&PoolConfig> for RetryConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_attempts: config.max_connect_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}

impl RetryConfig {
    /// The delay after `delay`, capped at `max_delay`. A factor below 1.0 or
    /// not finite keeps the delay constant.
    fn next_delay(&self, delay: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let cap = self.max_delay.max(self.initial_delay);
        Duration::try_from_secs_f64((delay.as_secs_f64() * factor).min(cap.as_secs_f64()))
            .unwrap_or(cap)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. The closure receives the attempt number
/// (starting at 1). The last error is returned unchanged so callers can still
/// tell a refused credential from an unreachable host.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> FleetResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FleetResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        let err = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} connected on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            if attempt > 1 {
                tracing::warn!("{} giving up after {} attempts: {}", label, attempt, err);
            }
            return Err(err);
        }

        let sleep_time = delay + Duration::from_millis(rand_jitter(delay));
        tracing::warn!(
            "{} attempt {}/{} failed ({}), retrying in {:.2}s",
            label,
            attempt,
            max_attempts,
            err,
            sleep_time.as_secs_f64()
        );
        tokio::time::sleep(sleep_time).await;

        delay = config.next_delay(delay);
        attempt += 1;
    }
}

/// Up to a quarter of the current delay.
fn rand_jitter(delay: Duration) -> u64 {
    let bound = (delay.as_millis() as u64 / 4).max(1);
    rand::thread_rng().gen_range(0..bound)
}
