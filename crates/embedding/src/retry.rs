//! Bounded retry with exponential backoff for provider calls.
//!
//! The loop is explicit and typed: each attempt reports a
//! [`ProviderFailure`], the loop decides between retrying (with either
//! the provider's own `Retry-After` hint or the exponential schedule)
//! and giving up. Exhaustion becomes [`EmbeddingError::Unavailable`],
//! which callers recover from by falling back to the last-known vector.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, ProviderFailure};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first call included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "crate::serde_millis", default = "default_base_delay")]
    pub base_delay: Duration,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(with = "crate::serde_millis", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Random 0-50% on top of each delay to spread thundering herds.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.max_attempts == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(EmbeddingError::InvalidConfig(
                "retry.backoff_factor must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Backoff before retrying after the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_millis() as f64;
        let exp = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let mut delay = exp.min(cap);
        if self.jitter {
            delay = (delay * (1.0 + fastrand::f64() * 0.5)).min(cap);
        }
        Duration::from_millis(delay as u64)
    }
}

/// Runs `operation` up to `config.max_attempts` times.
///
/// A `RateLimited` failure with a server hint sleeps for the hint
/// instead of the exponential schedule. `Fatal` failures abort at
/// once; they are returned as [`EmbeddingError::Provider`].
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, EmbeddingError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    let mut last_error = String::new();
    for attempt in 0..config.max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if !failure.is_retryable() {
                    return Err(EmbeddingError::Provider(failure));
                }
                last_error = failure.to_string();
                if attempt + 1 < config.max_attempts {
                    let delay = match &failure {
                        ProviderFailure::RateLimited {
                            retry_after: Some(hint),
                        } => *hint,
                        _ => config.delay_for(attempt),
                    };
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "embedding call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(EmbeddingError::Unavailable {
        attempts: config.max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false)
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let cfg = RetryConfig {
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(3),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(cfg.delay_for(0), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(1), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(3));
        assert_eq!(cfg.delay_for(5), Duration::from_secs(3));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(600),
            jitter: true,
            ..Default::default()
        };
        for attempt in 0..8 {
            assert!(cfg.delay_for(attempt) <= Duration::from_millis(600));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_config(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderFailure::Transient("boom".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_config(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderFailure::Transient("boom".into())) }
        })
        .await;
        match result {
            Err(EmbeddingError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_abort_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_config(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderFailure::Fatal("401 unauthorized".into())) }
        })
        .await;
        assert!(matches!(result, Err(EmbeddingError::Provider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_overrides_schedule() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_config(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ProviderFailure::RateLimited {
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        // Paused clock advances exactly by the sleeps we issued.
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
