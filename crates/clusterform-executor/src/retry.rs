//! Retry with exponential backoff and jitter for provider calls.
//!
//! Only transient provider errors are retried. A rate-limit response that
//! names a wait time is honoured instead of the computed delay.

use clusterform_provider::ProviderResult;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first call.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short delays for tests.
    pub fn fast(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts
/// `max_attempts`. Returns the final result and the number of attempts made.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> (ProviderResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return (Ok(result), attempt),
            Err(e) if !e.is_transient() => return (Err(e), attempt),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return (Err(e), attempt);
                }

                let wait = match e.retry_after() {
                    Some(after) => after,
                    None => {
                        // Jitter: 0.5x to 1.5x of the delay
                        let jitter = rand::thread_rng().gen_range(0.5..1.5);
                        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                    }
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis() as u64,
                    "Transient provider error, retrying"
                );

                tokio::time::sleep(wait).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterform_provider::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let (result, attempts) = retry_with_backoff(&RetryConfig::fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let (result, attempts): (ProviderResult<()>, u32) =
            retry_with_backoff(&RetryConfig::fast(5), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::invalid("region", "unknown"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let (result, attempts): (ProviderResult<()>, u32) =
            retry_with_backoff(&RetryConfig::fast(3), "op", || async {
                Err(ProviderError::Unavailable("maintenance".into()))
            })
            .await;

        assert_eq!(result, Err(ProviderError::Unavailable("maintenance".into())));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn honours_retry_after() {
        let started = std::time::Instant::now();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let (result, _) = retry_with_backoff(&RetryConfig::fast(2), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::RateLimited { retry_after_ms: 50 })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn config_delays_in_millis() {
        let c: RetryConfig = serde_json::from_str(r#"{"max_attempts": 3, "initial_delay": 50}"#).unwrap();
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.initial_delay, Duration::from_millis(50));
        assert_eq!(c.max_delay, Duration::from_secs(30));
    }
}
