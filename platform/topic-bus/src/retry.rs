//! Caller-side retry with exponential backoff
//!
//! The bus never retries on its own: a failed `connect` is returned as is.
//! Callers that want to wait for a broker to come up (service startup, the
//! `busctl` CLI) wrap the call in [`retry_with_backoff`].

use crate::{BusError, BusResult};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Example
/// ```rust
/// use topic_bus::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;

                // Exponential backoff with cap
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}

/// Retry a bus operation, giving up at once on configuration errors
///
/// Missing TLS material or bad settings will not fix themselves, so only
/// the other error kinds are retried.
pub async fn retry_bus_operation<F, Fut, T>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> BusResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = BusResult<T>>,
{
    let outcome = retry_with_backoff(
        || {
            let attempt = operation();
            async move {
                match attempt.await {
                    Err(e @ BusError::Configuration { .. }) => Ok(Err(e)),
                    other => other.map(Ok),
                }
            }
        },
        config,
        context,
    )
    .await;

    outcome.and_then(|inner| inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = retry_with_backoff(
            || async { Ok::<_, String>(42) },
            &RetryConfig::default(),
            "test_operation",
        )
        .await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    if *count < 3 {
                        Err(format!("Attempt {}", *count))
                    } else {
                        Ok(42)
                    }
                }
            },
            &fast(),
            "test_operation",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let result = retry_with_backoff(
            || async { Err::<i32, _>("persistent error") },
            &fast(),
            "test_operation",
        )
        .await;

        assert_eq!(result, Err("persistent error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(15),
        };
        let start = tokio::time::Instant::now();

        let _ = retry_with_backoff(|| async { Err::<(), _>("error") }, &config, "test_operation")
            .await;

        // 10ms + 15ms + 15ms with the paused clock auto-advancing
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_retried() {
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result: BusResult<()> = retry_bus_operation(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err(BusError::Configuration {
                        artifact: "certificate".to_string(),
                        reason: "missing".to_string(),
                    })
                }
            },
            &fast(),
            "connect",
        )
        .await;

        assert!(matches!(result, Err(BusError::Configuration { .. })));
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_errors_are_retried() {
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result: BusResult<()> = retry_bus_operation(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err(BusError::Connect("connection refused".to_string()))
                }
            },
            &fast(),
            "connect",
        )
        .await;

        assert!(matches!(result, Err(BusError::Connect(_))));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }
}
