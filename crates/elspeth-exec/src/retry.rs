//! Retry policy with exponential backoff: retryable errors are retried
//! up to `max_attempts`, and once exhausted become fatal, to be routed
//! per the node's `on_error` policy by the caller.

use std::future::Future;
use std::time::Duration;

use elspeth_core::config::RetryConfig;
use elspeth_core::error::ElspethError;

/// Run `attempt` up to `config.max_attempts` times. Only
/// `ElspethError::is_retryable()` errors are retried; a non-retryable
/// error (or the final attempt) is returned immediately. Delay doubles
/// each attempt, capped at `max_delay`, with optional full jitter.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut attempt: F) -> Result<T, ElspethError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ElspethError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.base_delay();

    for attempt_no in 1..=max_attempts {
        match attempt(attempt_no).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt_no == max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(jittered(delay, config.jitter)).await;
                delay = (delay * 2).min(config.max_delay());
            }
        }
    }
    unreachable!("loop always returns on its final iteration")
}

fn jittered(delay: Duration, jitter: bool) -> Duration {
    if !jitter || delay.is_zero() {
        return delay;
    }
    let max_ms = delay.as_millis().max(1) as u64;
    Duration::from_millis(rand::random::<u64>() % max_ms + 1)
}
