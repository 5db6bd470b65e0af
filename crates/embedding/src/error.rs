use std::time::Duration;

use thiserror::Error;

/// Classified outcome of a single provider call attempt.
///
/// The retry loop decides what to do from the variant alone: `Fatal`
/// stops immediately, everything else is eligible for another attempt.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderFailure {
    /// Provider told us to slow down. `retry_after` carries the
    /// server's backoff hint when the response included one.
    #[error("provider rate limited (retry_after: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Connection trouble or a 5xx; worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The call exceeded its per-request deadline.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Auth problems, bad requests, unparseable responses. Retrying
    /// cannot help.
    #[error("permanent provider failure: {0}")]
    Fatal(String),
}

impl ProviderFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderFailure::Fatal(_))
    }
}

/// Errors produced by the embedding layer.
#[derive(Debug, Error, Clone)]
pub enum EmbeddingError {
    /// Retries exhausted. Callers keep the subject's last-known vector
    /// and flag it stale instead of failing their batch.
    #[error("embedding provider unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// A failure the retry loop refused to retry.
    #[error(transparent)]
    Provider(#[from] ProviderFailure),

    /// Our own token bucket would not grant a slot within its wait
    /// budget. Treated like provider unavailability by callers.
    #[error("client-side rate limiter saturated after waiting {waited:?}")]
    LimiterSaturated { waited: Duration },

    #[error("invalid embedding config: {0}")]
    InvalidConfig(String),
}

impl EmbeddingError {
    /// True for the failure modes a caller recovers from by falling
    /// back to the last-known vector.
    pub fn is_unavailability(&self) -> bool {
        !matches!(self, EmbeddingError::InvalidConfig(_))
    }
}
