//! Bounded exponential backoff
//!
//! Shared by the generation client, the endpoint provider and the tool
//! backends. An operation is attempted at most `max_retries` times; only
//! errors the caller classifies as transient are retried.

use rand::Rng;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// Check if an HTTP status code indicates a retryable error
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Delay before the retry that follows attempt `attempt` (0-based).
    pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let pow = config.backoff_multiplier.powi(attempt.min(31) as i32);
        let delay_ms = ((config.initial_backoff_ms as f32 * pow) as u64).min(config.max_backoff_ms);

        let jitter = config.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let mut rng = rand::rng();
            let jitter_scale: f32 = rng.random_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * jitter_scale).round() as i64;
            let adjusted = (delay_ms as i64 + jitter_ms).max(0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of
/// attempts. The last error is returned unchanged.
///
/// - `operation(attempt)`: perform one attempt (0-based)
/// - `is_transient(&err)`: whether the error is worth another attempt
pub async fn retry_with_backoff<T, E, Op, Fut, Pred>(
    config: &RetryConfig,
    label: &str,
    mut operation: Op,
    is_transient: Pred,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Pred: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_retries.max(1);
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }
                if attempt + 1 >= max {
                    tracing::warn!(
                        operation = label,
                        attempts = attempt + 1,
                        "Retries exhausted: {}",
                        err
                    );
                    return Err(err);
                }

                let delay = BackoffCalculator::calculate_delay(config, attempt);
                tracing::debug!(
                    operation = label,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, backing off: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_no_jitter_progression_and_cap() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(BackoffCalculator::calculate_delay(&cfg, 0), Duration::from_millis(100));
        assert_eq!(BackoffCalculator::calculate_delay(&cfg, 1), Duration::from_millis(200));
        assert_eq!(BackoffCalculator::calculate_delay(&cfg, 2), Duration::from_millis(250));
        assert_eq!(BackoffCalculator::calculate_delay(&cfg, 40), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_with_jitter_within_bounds() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.5,
        };
        for _ in 0..50 {
            let d = BackoffCalculator::calculate_delay(&cfg, 2).as_millis() as f32;
            assert!((199.0..=601.0).contains(&d));
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<&str, String> = retry_with_backoff(
            &fast_config(3),
            "test",
            |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("503".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), String> = retry_with_backoff(
            &fast_config(5),
            "test",
            |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("400".to_string())
                }
            },
            |e| e != "400",
        )
        .await;

        assert_eq!(result, Err("400".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<(), String> = retry_with_backoff(
            &fast_config(2),
            "test",
            |attempt| async move { Err(format!("attempt {}", attempt)) },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("attempt 1".to_string()));
    }
}
