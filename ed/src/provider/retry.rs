//! Retry policy with exponential backoff and jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::ProviderError;

/// Exponential backoff schedule with symmetric ±25% jitter
///
/// Only retryable errors (rate limit, transient provider failure, timeout)
/// are rescheduled; after exhaustion the last error propagates unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The un-jittered delay before retry `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Jittered delay: base ± 25%
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let factor = rand::rng().random_range(0.75..=1.25);
        Duration::from_millis((base * factor) as u64)
    }

    /// Run `op` under this policy
    ///
    /// `op` receives the 0-based attempt number. A rate-limit error carrying
    /// a `retry-after` hint sleeps for at least that long.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..self.max_attempts.max(1) {
            if attempt > 0 {
                let mut delay = self.jittered_delay(attempt);
                if let Some(ProviderError::RateLimit {
                    retry_after: Some(hint),
                }) = &last_error
                {
                    delay = delay.max(*hint);
                }
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts.max(1) => {
                    debug!(attempt, error = %e, "attempt failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Unknown("retries exhausted".to_string())))
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_base_delay_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        // Capped at max_delay
        assert_eq!(policy.base_delay(3), Duration::from_millis(350));
        assert_eq!(policy.base_delay(10), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(10),
        };
        for _ in 0..100 {
            let jittered = policy.jittered_delay(1).as_millis();
            assert!((750..=1250).contains(&jittered), "jitter out of range: {jittered}");
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Provider {
                            status: 503,
                            message: "unavailable".into(),
                            retryable: true,
                        })
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = fast_policy(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ProviderError::InvalidKey) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidKey)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_propagates_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = fast_policy(3)
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(ProviderError::Provider {
                        status: 500,
                        message: format!("failure {n}"),
                        retryable: true,
                    })
                }
            })
            .await;
        match result {
            Err(ProviderError::Provider { message, .. }) => assert_eq!(message, "failure 2"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
