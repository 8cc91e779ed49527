// ABOUTME: Retry executor with exponential backoff for transient unit failures
// ABOUTME: Also wraps external calls in timeouts that surface as retryable errors

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{UnitError, UnitErrorKind};

/// Invoke `operation` until it succeeds, fails with a fatal error, or attempts run out.
///
/// The closure receives the 1-based attempt number. Attempt `n >= 2` is preceded by
/// `base_delay * multiplier^(n-2)`; there is no jitter. The last error is returned
/// when retries are exhausted.
pub async fn run_with_retry<T, F, Fut>(
    mut operation: F,
    context: &str,
    config: &RetryConfig,
) -> Result<T, UnitError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UnitError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = config.delay_before(attempt);
        if !delay.is_zero() {
            tracing::info!(
                "Retrying {} in {:?} (attempt {}/{})",
                context,
                delay,
                attempt,
                max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", context, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    "{} failed with transient error (attempt {}/{}): {}",
                    context,
                    attempt,
                    max_attempts,
                    err
                );
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(
                        "{} failed after {} attempts: {}",
                        context,
                        max_attempts,
                        err
                    );
                } else {
                    tracing::error!("{} failed with non-retryable error: {}", context, err);
                }
                return Err(err);
            }
        }
    }
}

/// Bound an external call. Elapsed time is reported as a retryable `Timeout`.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, fut: Fut) -> Result<T, UnitError>
where
    Fut: Future<Output = Result<T, UnitError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(UnitError::new(
            UnitErrorKind::Timeout,
            format!("{} timed out after {:?}", what, limit),
        )),
    }
}
