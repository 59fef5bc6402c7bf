// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff for transient upstream failures.
//!
//! A direct generalisation of the sidecar retry loop used elsewhere in this
//! workspace: same shape (`compute_delay` + `retry_async`), adapted from a
//! single retryable error enum to anything that can report "was this a
//! transient failure or a permanent one".

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff parameters for a retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    /// `max_retries: 1` matches the adapter's 5xx policy: one retry after
    /// the initial attempt, two tries total.
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.5,
        }
    }
}

/// Compute the backoff delay for a zero-indexed attempt number.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Run `op` up to `max_retries + 1` times, backing off between attempts for
/// which `retryable` returns `true`. The first non-retryable error, or the
/// error from the final attempt, is returned as-is.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;

    for attempt in 0..max_attempts {
        debug!(attempt, max_attempts, "adapter: attempting upstream call");
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "adapter: call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;
                if !retryable(&err) || is_last {
                    if is_last && attempt > 0 {
                        warn!(attempt, error = %err, "adapter: retries exhausted");
                    }
                    return Err(err);
                }
                let delay = compute_delay(config, attempt);
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "adapter: retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
    unreachable!("loop always returns by the last iteration")
}
