//! Client-side token-bucket throttle for provider calls.
//!
//! Separate from the provider's own 429 handling: the bucket spaces
//! our requests out before they leave the process, the retry loop
//! deals with the provider pushing back anyway. Waiting happens in
//! `tokio::time::sleep` outside the bucket lock, so holding a slot
//! never blocks other callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::EmbeddingError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Bucket capacity; short bursts up to this size pass untouched.
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,

    /// Longest a caller is willing to queue for a slot.
    #[serde(with = "crate::serde_millis", default = "default_max_wait")]
    pub max_wait: Duration,
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_burst_capacity() -> u32 {
    10
}

fn default_max_wait() -> Duration {
    Duration::from_secs(5)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_capacity: default_burst_capacity(),
            max_wait: default_max_wait(),
        }
    }
}

impl RateLimitConfig {
    pub fn with_requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub fn with_burst_capacity(mut self, burst_capacity: u32) -> Self {
        self.burst_capacity = burst_capacity;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if !(self.requests_per_second > 0.0) {
            return Err(EmbeddingError::InvalidConfig(
                "rate_limit.requests_per_second must be positive".into(),
            ));
        }
        if self.burst_capacity == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "rate_limit.burst_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("rate limiter wait budget {max_wait:?} exceeded")]
    WaitExceeded { max_wait: Duration },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with atomic counters for observability.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    total_granted: AtomicU64,
    total_rejected: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst_capacity as f64,
                last_refill: Instant::now(),
            }),
            total_granted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.config.max_wait
    }

    /// Waits for a slot, up to the configured wait budget.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let start = Instant::now();
        loop {
            let needed = {
                let mut state = self.state.lock().await;
                refill(&mut state, &self.config);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.config.requests_per_second,
                    ))
                }
            };
            match needed {
                None => {
                    self.total_granted.fetch_add(1, Ordering::Relaxed);
                    self.total_wait_micros
                        .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                    return Ok(());
                }
                Some(wait) => {
                    if start.elapsed() + wait > self.config.max_wait {
                        self.total_rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(RateLimitError::WaitExceeded {
                            max_wait: self.config.max_wait,
                        });
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Non-waiting variant; also declines when the bucket is contended.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        refill(&mut state, &self.config);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let granted = self.total_granted.load(Ordering::Relaxed);
        let wait_micros = self.total_wait_micros.load(Ordering::Relaxed);
        RateLimitStats {
            total_granted: granted,
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            average_wait: if granted == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(wait_micros / granted)
            },
        }
    }
}

fn refill(state: &mut BucketState, config: &RateLimitConfig) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    state.tokens =
        (state.tokens + elapsed * config.requests_per_second).min(config.burst_capacity as f64);
    state.last_refill = now;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitStats {
    pub total_granted: u64,
    pub total_rejected: u64,
    pub average_wait: Duration,
}

impl RateLimitStats {
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_granted + self.total_rejected;
        if total == 0 {
            0.0
        } else {
            self.total_rejected as f64 / total as f64
        }
    }
}
