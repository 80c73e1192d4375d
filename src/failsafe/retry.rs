//! Admission retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use super::rate_limiter::{AdmissionDecision, AdmissionLimiter};
use crate::config::RetryConfig;
use crate::{Error, Result};

/// Backoff schedule: `base_delay * 2^attempt`, at most `max_retries` delays
fn backoff_schedule(config: &RetryConfig) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(config.base_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0)
        .with_max_times(config.max_retries as usize)
        .build()
}

/// Run `operation` once admission for `(policy, identifier)` is granted.
///
/// A refusal waits `min(retry_after, base_delay * 2^attempt)` and asks again.
/// The wait is a plain `sleep`, so dropping the returned future cancels it.
///
/// # Errors
///
/// Returns [`Error::RateLimited`] with the last retry hint once retries are
/// exhausted, [`Error::UnknownPolicy`] for an unconfigured policy, or the
/// error returned by `operation`.
pub async fn with_rate_limit<F, Fut, T>(
    limiter: &AdmissionLimiter,
    policy: &str,
    identifier: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = backoff_schedule(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match limiter.check_limit(policy, identifier)? {
            AdmissionDecision::Admitted { .. } => return operation().await,
            AdmissionDecision::Rejected { retry_after_secs } => {
                let Some(backoff) = delays.next() else {
                    debug!(policy, identifier, attempts = attempt, "Admission retries exhausted");
                    return Err(Error::RateLimited {
                        policy: policy.to_string(),
                        retry_after_secs,
                    });
                };
                // Never sleep zero: a window that resets "now" needs one more tick
                let delay = backoff
                    .min(Duration::from_secs(retry_after_secs))
                    .max(Duration::from_millis(1));
                debug!(
                    policy,
                    identifier,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Waiting for admission"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::{RateLimitConfig, RateLimitPolicy};

    fn limiter(max_requests: u32, window: Duration) -> AdmissionLimiter {
        AdmissionLimiter::new(&RateLimitConfig {
            enabled: true,
            policies: HashMap::from([(
                "test".to_string(),
                RateLimitPolicy::new(max_requests, window),
            )]),
            retry: RetryConfig::default(),
        })
    }

    #[test]
    fn test_schedule_doubles() {
        let config = RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        let delays: Vec<_> = backoff_schedule(&config).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_window() {
        let limiter = limiter(1, Duration::from_secs(2));
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        };
        limiter.check_limit("test", "a").unwrap();

        let started = tokio::time::Instant::now();
        let value = with_rate_limit(&limiter, "test", "a", &config, || async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(started.elapsed() > Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries() {
        let limiter = limiter(1, Duration::from_secs(60));
        let config = RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        limiter.check_limit("test", "a").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_rate_limit(&limiter, "test", "a", &config, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(err.to_string().contains("try again after 60 seconds"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_propagates() {
        let limiter = limiter(5, Duration::from_secs(60));
        let err = with_rate_limit(&limiter, "test", "a", &RetryConfig::default(), || async {
            Err::<(), _>(Error::Provider("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
