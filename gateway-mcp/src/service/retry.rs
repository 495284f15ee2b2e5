//! Exponential-backoff retry for upstream operations

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::McpResult;

/// Retry policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or the retries are exhausted; the last
/// error is surfaced.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> McpResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = McpResult<T>>,
{
    let mut delay = policy.initial_delay;
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            debug!(
                operation = operation_name,
                attempt,
                max_retries = policy.max_retries,
                ?delay,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(policy.backoff_factor);
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    attempts = policy.max_retries + 1,
                    "attempt failed: {}",
                    e
                );
                last_error = Some(e);
            }
        }
    }

    let error = last_error.expect("at least one attempt ran");
    warn!(
        operation = operation_name,
        attempts = policy.max_retries + 1,
        "operation failed after all attempts: {}",
        error
    );
    Err(error)
}
